//! Composable GTID stream filters
//!
//! Log-dump tools and chained replication readers decide event inclusion by
//! running every GTID through a filter tree. `exclude` returns `true` when
//! the event group belonging to the GTID should be left out of the result;
//! `has_finished` reports that no further event can ever be included, which
//! lets readers stop early.
//!
//! The tree is a tagged variant:
//!
//! - [`GtidEventFilter::AcceptAll`] / [`GtidEventFilter::RejectAll`] —
//!   defaults for unfiltered identifiers; never finish.
//! - [`WindowFilter`] — a stateful `(start, stop]` range over the sequence
//!   numbers of one identifier. While active it passes every GTID of the
//!   identifier, including foreign `server_id`s, which is what makes
//!   windows work across mixed-origin streams.
//! - [`DelegatingFilter`] — routes by domain or server id to per-identifier
//!   children with a default for lookup misses; carries whitelist and
//!   blacklist construction.
//! - [`GtidEventFilter::Intersecting`] — excludes when either child does.
//!
//! Filters buffer non-fatal warnings (out-of-order sequences, overshot stop
//! positions) instead of polluting the output mid-stream; callers flush
//! them with `write_warnings` at end of stream.

use crate::error::{GtidError, Result};
use crate::gtid::{parse_gtid_list_unique_domains, Gtid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};

const WARN_SEQ_OUT_OF_ORDER: u32 = 0x1;
const WARN_STOP_OVERSHOOT: u32 = 0x2;

/// A stateful window `(start, stop]` over one identifier's stream.
///
/// Inactive until the first GTID with matching `(domain, server)` and a
/// sequence number strictly above `start`; active windows pass all GTIDs of
/// the identifier until the stop GTID (inclusive) has been seen. Without a
/// start the window begins active; without a stop it never closes.
#[derive(Debug, Clone, Default)]
pub struct WindowFilter {
    start: Option<Gtid>,
    stop: Option<Gtid>,
    active: bool,
    passed: bool,
    last_seen: Option<Gtid>,
    warnings: u32,
    strict: bool,
}

impl WindowFilter {
    /// Create a window; `start` is exclusive, `stop` inclusive.
    pub fn new(start: Option<Gtid>, stop: Option<Gtid>) -> Self {
        Self {
            start,
            stop,
            active: start.is_none(),
            ..Default::default()
        }
    }

    /// Set the exclusive start GTID.
    pub fn set_start_gtid(&mut self, start: Gtid) {
        self.start = Some(start);
        self.active = false;
    }

    /// Set the inclusive stop GTID.
    pub fn set_stop_gtid(&mut self, stop: Gtid) {
        self.stop = Some(stop);
    }

    /// Remove the start position; the window begins active.
    pub fn clear_start_gtid(&mut self) {
        self.start = None;
        if !self.passed {
            self.active = true;
        }
    }

    /// Remove the stop position; the window never closes.
    pub fn clear_stop_gtid(&mut self) {
        self.stop = None;
    }

    pub fn has_start(&self) -> bool {
        self.start.is_some()
    }

    pub fn has_stop(&self) -> bool {
        self.stop.is_some()
    }

    pub fn start_gtid(&self) -> Option<Gtid> {
        self.start
    }

    pub fn stop_gtid(&self) -> Option<Gtid> {
        self.stop
    }

    /// Enable strict sequence processing: an overshot stop finishes the
    /// window with a warning instead of leaving it open.
    pub fn set_strict_mode(&mut self, strict: bool) {
        self.strict = strict;
    }

    fn exclude(&mut self, gtid: &Gtid) -> bool {
        if self.passed {
            return true;
        }
        if !self.active {
            match self.start {
                None => self.active = true,
                Some(start) => {
                    if gtid.domain_id == start.domain_id
                        && gtid.server_id == start.server_id
                        && gtid.seq_no > start.seq_no
                    {
                        self.active = true;
                    }
                }
            }
            if !self.active {
                return true;
            }
        }

        // Streams are expected to be sequential inside a window; a
        // regression is worth a warning but never fatal.
        if let Some(last) = self.last_seen {
            if gtid.seq_no <= last.seq_no {
                self.warnings |= WARN_SEQ_OUT_OF_ORDER;
            }
        }
        self.last_seen = Some(*gtid);

        if let Some(stop) = self.stop {
            if gtid.server_id == stop.server_id && gtid.seq_no == stop.seq_no {
                self.passed = true;
                self.active = false;
                return false;
            }
            if self.strict && gtid.seq_no > stop.seq_no {
                self.warnings |= WARN_STOP_OVERSHOOT;
                self.passed = true;
                self.active = false;
                return true;
            }
        }
        false
    }

    fn has_finished(&self) -> bool {
        self.passed
    }

    fn write_warnings(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let identifier = self
            .start
            .or(self.stop)
            .or(self.last_seen)
            .map_or(0, |g| g.domain_id);
        if self.warnings & WARN_SEQ_OUT_OF_ORDER != 0 {
            writeln!(
                out,
                "WARNING: GTID sequence numbers in domain {identifier} are out of order"
            )?;
        }
        if self.warnings & WARN_STOP_OVERSHOOT != 0 {
            if let Some(stop) = self.stop {
                writeln!(
                    out,
                    "WARNING: stop position {stop} was never seen; filtering ended after \
                     passing its sequence number"
                )?;
            }
        }
        self.warnings = 0;
        Ok(())
    }
}

/// How a delegating filter extracts the routing identifier from a GTID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterKey {
    Domain,
    Server,
}

impl FilterKey {
    fn id_of(self, gtid: &Gtid) -> u32 {
        match self {
            Self::Domain => gtid.domain_id,
            Self::Server => gtid.server_id,
        }
    }
}

/// Routes each GTID to a per-identifier child filter, falling back to a
/// default for identifiers without an explicit child.
#[derive(Debug)]
pub struct DelegatingFilter {
    key: FilterKey,
    children: HashMap<u32, GtidEventFilter>,
    default_filter: Box<GtidEventFilter>,
    whitelist_set: bool,
    blacklist_set: bool,
    strict: bool,
    start_gtids: Vec<Gtid>,
    stop_gtids: Vec<Gtid>,
}

impl DelegatingFilter {
    fn new(key: FilterKey) -> Self {
        Self {
            key,
            children: HashMap::new(),
            default_filter: Box::new(GtidEventFilter::AcceptAll),
            whitelist_set: false,
            blacklist_set: false,
            strict: false,
            start_gtids: Vec::new(),
            stop_gtids: Vec::new(),
        }
    }

    /// A filter routing by `domain_id`.
    pub fn by_domain() -> Self {
        Self::new(FilterKey::Domain)
    }

    /// A filter routing by `server_id`.
    pub fn by_server() -> Self {
        Self::new(FilterKey::Server)
    }

    /// Include only the listed identifiers: the default becomes reject-all
    /// and each listed id gets an explicit child (an accepting one unless a
    /// window was already installed).
    pub fn set_whitelist(&mut self, ids: &[u32]) -> Result<()> {
        if self.blacklist_set {
            return Err(GtidError::filter_conflict(
                "whitelist cannot be combined with an existing blacklist",
            ));
        }
        self.whitelist_set = true;
        *self.default_filter = GtidEventFilter::RejectAll;
        for &id in ids {
            self.children.entry(id).or_insert(GtidEventFilter::AcceptAll);
        }
        Ok(())
    }

    /// Exclude the listed identifiers; everything else passes the default.
    pub fn set_blacklist(&mut self, ids: &[u32]) -> Result<()> {
        if self.whitelist_set {
            return Err(GtidError::filter_conflict(
                "blacklist cannot be combined with an existing whitelist",
            ));
        }
        self.blacklist_set = true;
        for &id in ids {
            match self.children.entry(id) {
                std::collections::hash_map::Entry::Occupied(e)
                    if !matches!(e.get(), GtidEventFilter::RejectAll) =>
                {
                    return Err(GtidError::filter_conflict(format!(
                        "identifier {id} already carries an explicit filter"
                    )));
                }
                entry => {
                    *entry.or_insert(GtidEventFilter::RejectAll) = GtidEventFilter::RejectAll;
                }
            }
        }
        Ok(())
    }

    /// Mixed mode: supply the fallback filter directly.
    pub fn set_default_filter(&mut self, filter: GtidEventFilter) {
        *self.default_filter = filter;
    }

    /// Begin a window for the GTID's domain at `gtid` (exclusive).
    ///
    /// Only meaningful on domain-routed filters; each domain may carry one
    /// start position.
    pub fn add_start_gtid(&mut self, gtid: Gtid) -> Result<()> {
        let window = self.window_for(gtid)?;
        if window.has_start() {
            return Err(GtidError::filter_conflict(format!(
                "domain {} already has a start position",
                gtid.domain_id
            )));
        }
        window.set_start_gtid(gtid);
        self.start_gtids.push(gtid);
        Ok(())
    }

    /// End the window for the GTID's domain at `gtid` (inclusive).
    pub fn add_stop_gtid(&mut self, gtid: Gtid) -> Result<()> {
        let window = self.window_for(gtid)?;
        if window.has_stop() {
            return Err(GtidError::filter_conflict(format!(
                "domain {} already has a stop position",
                gtid.domain_id
            )));
        }
        window.set_stop_gtid(gtid);
        self.stop_gtids.push(gtid);
        Ok(())
    }

    fn window_for(&mut self, gtid: Gtid) -> Result<&mut WindowFilter> {
        if self.key != FilterKey::Domain {
            return Err(GtidError::filter_conflict(
                "start/stop positions are domain-scoped",
            ));
        }
        let strict = self.strict;
        let entry = self
            .children
            .entry(gtid.domain_id)
            .or_insert_with(|| {
                let mut w = WindowFilter::new(None, None);
                w.set_strict_mode(strict);
                GtidEventFilter::Window(w)
            });
        match entry {
            GtidEventFilter::Window(w) => Ok(w),
            GtidEventFilter::AcceptAll => {
                // A whitelisted domain upgrades to a window.
                let mut w = WindowFilter::new(None, None);
                w.set_strict_mode(strict);
                *entry = GtidEventFilter::Window(w);
                match entry {
                    GtidEventFilter::Window(w) => Ok(w),
                    _ => unreachable!(),
                }
            }
            _ => Err(GtidError::filter_conflict(format!(
                "domain {} is excluded and cannot carry a window",
                gtid.domain_id
            ))),
        }
    }

    /// Drop all start positions; their windows begin active.
    pub fn clear_start_gtids(&mut self) {
        for gtid in std::mem::take(&mut self.start_gtids) {
            if let Some(GtidEventFilter::Window(w)) = self.children.get_mut(&gtid.domain_id) {
                w.clear_start_gtid();
            }
        }
    }

    /// Drop all stop positions; their windows never close.
    pub fn clear_stop_gtids(&mut self) {
        for gtid in std::mem::take(&mut self.stop_gtids) {
            if let Some(GtidEventFilter::Window(w)) = self.children.get_mut(&gtid.domain_id) {
                w.clear_stop_gtid();
            }
        }
    }

    /// All configured start positions.
    pub fn start_gtids(&self) -> &[Gtid] {
        &self.start_gtids
    }

    /// All configured stop positions.
    pub fn stop_gtids(&self) -> &[Gtid] {
        &self.stop_gtids
    }

    /// Toggle strict sequence processing for every window child, present
    /// and future.
    pub fn set_gtid_strict_mode(&mut self, strict: bool) {
        self.strict = strict;
        for child in self.children.values_mut() {
            if let GtidEventFilter::Window(w) = child {
                w.set_strict_mode(strict);
            }
        }
        if let GtidEventFilter::Window(w) = self.default_filter.as_mut() {
            w.set_strict_mode(strict);
        }
    }

    fn exclude(&mut self, gtid: &Gtid) -> bool {
        let id = self.key.id_of(gtid);
        match self.children.get_mut(&id) {
            Some(child) => child.exclude(gtid),
            None => self.default_filter.exclude(gtid),
        }
    }

    fn has_finished(&self) -> bool {
        !self.children.is_empty()
            && matches!(*self.default_filter, GtidEventFilter::RejectAll)
            && self.children.values().all(GtidEventFilter::has_finished)
    }

    fn write_warnings(&mut self, out: &mut dyn Write) -> io::Result<()> {
        for child in self.children.values_mut() {
            child.write_warnings(out)?;
        }
        self.default_filter.write_warnings(out)
    }
}

/// A node of the filter tree.
#[derive(Debug)]
pub enum GtidEventFilter {
    /// Include every GTID. The default for unfiltered identifiers.
    AcceptAll,
    /// Exclude every GTID.
    RejectAll,
    /// A `(start, stop]` window over one identifier.
    Window(WindowFilter),
    /// Per-identifier delegation with a default.
    Delegating(DelegatingFilter),
    /// Excludes when either child excludes; includes only in the
    /// intersection.
    Intersecting(Box<GtidEventFilter>, Box<GtidEventFilter>),
}

impl GtidEventFilter {
    /// Combine two filters so only GTIDs passing both are included.
    pub fn intersect(a: GtidEventFilter, b: GtidEventFilter) -> Self {
        Self::Intersecting(Box::new(a), Box::new(b))
    }

    /// Should the event group of `gtid` be excluded from the output?
    pub fn exclude(&mut self, gtid: &Gtid) -> bool {
        match self {
            Self::AcceptAll => false,
            Self::RejectAll => true,
            Self::Window(w) => w.exclude(gtid),
            Self::Delegating(d) => d.exclude(gtid),
            Self::Intersecting(a, b) => {
                // Run both children so stateful filters observe the full
                // stream regardless of the other side's verdict.
                let ex_a = a.exclude(gtid);
                let ex_b = b.exclude(gtid);
                ex_a || ex_b
            }
        }
    }

    /// True when no further GTID can ever be included.
    pub fn has_finished(&self) -> bool {
        match self {
            Self::AcceptAll | Self::RejectAll => false,
            Self::Window(w) => w.has_finished(),
            Self::Delegating(d) => d.has_finished(),
            Self::Intersecting(a, b) => a.has_finished() && b.has_finished(),
        }
    }

    /// Flush buffered non-fatal warnings to `out` and clear them.
    pub fn write_warnings(&mut self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::AcceptAll | Self::RejectAll => Ok(()),
            Self::Window(w) => w.write_warnings(out),
            Self::Delegating(d) => d.write_warnings(out),
            Self::Intersecting(a, b) => {
                a.write_warnings(out)?;
                b.write_warnings(out)
            }
        }
    }
}

impl From<DelegatingFilter> for GtidEventFilter {
    fn from(filter: DelegatingFilter) -> Self {
        Self::Delegating(filter)
    }
}

impl From<WindowFilter> for GtidEventFilter {
    fn from(filter: WindowFilter) -> Self {
        Self::Window(filter)
    }
}

/// Declarative filter configuration, the shape log-dump tools and
/// connector configs deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GtidFilterConfig {
    /// Domains to include (whitelist); empty means all.
    #[serde(default)]
    pub do_domain_ids: Vec<u32>,
    /// Domains to exclude (blacklist).
    #[serde(default)]
    pub ignore_domain_ids: Vec<u32>,
    /// Servers to include (whitelist); empty means all.
    #[serde(default)]
    pub do_server_ids: Vec<u32>,
    /// Servers to exclude (blacklist).
    #[serde(default)]
    pub ignore_server_ids: Vec<u32>,
    /// Exclusive start positions, one GTID per domain, as list text.
    #[serde(default)]
    pub start_position: Option<String>,
    /// Inclusive stop positions, one GTID per domain, as list text.
    #[serde(default)]
    pub stop_position: Option<String>,
    /// Strict sequence processing for windows.
    #[serde(default)]
    pub gtid_strict_mode: bool,
}

impl GtidFilterConfig {
    /// Compile the configuration into a filter tree.
    pub fn build(&self) -> Result<GtidEventFilter> {
        if !self.do_domain_ids.is_empty() && !self.ignore_domain_ids.is_empty() {
            return Err(GtidError::filter_conflict(
                "do_domain_ids and ignore_domain_ids are mutually exclusive",
            ));
        }
        if !self.do_server_ids.is_empty() && !self.ignore_server_ids.is_empty() {
            return Err(GtidError::filter_conflict(
                "do_server_ids and ignore_server_ids are mutually exclusive",
            ));
        }

        let mut domain_filter: Option<DelegatingFilter> = None;
        let need_domain = !self.do_domain_ids.is_empty()
            || !self.ignore_domain_ids.is_empty()
            || self.start_position.is_some()
            || self.stop_position.is_some();
        if need_domain {
            let mut filter = DelegatingFilter::by_domain();
            filter.set_gtid_strict_mode(self.gtid_strict_mode);
            if let Some(text) = &self.start_position {
                let list = parse_gtid_list_unique_domains(text)?;
                if list.is_empty() {
                    return Err(GtidError::EmptyGtidList);
                }
                for gtid in list {
                    filter.add_start_gtid(gtid)?;
                }
            }
            if let Some(text) = &self.stop_position {
                let list = parse_gtid_list_unique_domains(text)?;
                if list.is_empty() {
                    return Err(GtidError::EmptyGtidList);
                }
                for gtid in list {
                    filter.add_stop_gtid(gtid)?;
                }
            }
            if !self.do_domain_ids.is_empty() {
                filter.set_whitelist(&self.do_domain_ids)?;
            }
            if !self.ignore_domain_ids.is_empty() {
                filter.set_blacklist(&self.ignore_domain_ids)?;
            }
            // Explicit windows imply a whitelist of their domains.
            if self.do_domain_ids.is_empty()
                && self.ignore_domain_ids.is_empty()
                && (self.start_position.is_some() || self.stop_position.is_some())
            {
                filter.set_default_filter(GtidEventFilter::RejectAll);
            }
            domain_filter = Some(filter);
        }

        let mut server_filter: Option<DelegatingFilter> = None;
        if !self.do_server_ids.is_empty() || !self.ignore_server_ids.is_empty() {
            let mut filter = DelegatingFilter::by_server();
            if !self.do_server_ids.is_empty() {
                filter.set_whitelist(&self.do_server_ids)?;
            }
            if !self.ignore_server_ids.is_empty() {
                filter.set_blacklist(&self.ignore_server_ids)?;
            }
            server_filter = Some(filter);
        }

        Ok(match (domain_filter, server_filter) {
            (Some(d), Some(s)) => GtidEventFilter::intersect(d.into(), s.into()),
            (Some(d), None) => d.into(),
            (None, Some(s)) => s.into(),
            (None, None) => GtidEventFilter::AcceptAll,
        })
    }
}
