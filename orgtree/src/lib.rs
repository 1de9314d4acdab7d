//! Org outline library: a lossless, line-level element tree for Org documents.
//! Parsing keeps every source line verbatim so the writer reproduces the input byte for byte;
//! the query modules derive tags, properties and clocked time from the finished tree.

pub mod error {
    use std::io;

    /// Failures surfaced by the library. I/O problems, missing lookups and unfinished
    /// accessors are kept apart so callers can match on them.
    #[derive(Debug, thiserror::Error)]
    pub enum OrgError {
        #[error("{context}: {source}")]
        Io {
            context: String,
            #[source]
            source: io::Error,
        },
        #[error("no such attribute: {0}")]
        NoSuchAttribute(String),
        #[error("undefined property: {0}")]
        UndefinedProperty(String),
        #[error("no drawer named {0}")]
        NoSuchDrawer(String),
        #[error("not implemented: {0}")]
        NotImplemented(&'static str),
    }

    impl OrgError {
        pub fn io(context: impl Into<String>, source: io::Error) -> Self {
            Self::Io {
                context: context.into(),
                source,
            }
        }

        /// True for the lookup failures of single-value accessors.
        pub fn is_not_found(&self) -> bool {
            matches!(
                self,
                Self::NoSuchAttribute(_) | Self::UndefinedProperty(_) | Self::NoSuchDrawer(_)
            )
        }
    }

    pub type Result<T> = std::result::Result<T, OrgError>;
}

pub mod interval {
    //! Half-open time intervals `[start, end)` whose sides may be unbounded.

    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};
    use std::{fmt, iter::Sum, ops::Add};

    /// Length of an interval in whole seconds.
    ///
    /// `Undefined` is the duration of an open or invalid interval. It absorbs
    /// anything it is added to, so one open clock entry makes a total undefined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum IntervalDuration {
        Seconds(i64),
        Undefined,
    }

    impl IntervalDuration {
        pub const ZERO: Self = Self::Seconds(0);

        pub fn seconds(self) -> Option<i64> {
            match self {
                Self::Seconds(s) => Some(s),
                Self::Undefined => None,
            }
        }

        pub fn is_defined(self) -> bool {
            matches!(self, Self::Seconds(_))
        }
    }

    impl Default for IntervalDuration {
        fn default() -> Self {
            Self::ZERO
        }
    }

    impl Add for IntervalDuration {
        type Output = Self;

        fn add(self, rhs: Self) -> Self {
            match (self, rhs) {
                (Self::Seconds(a), Self::Seconds(b)) => Self::Seconds(a.saturating_add(b)),
                _ => Self::Undefined,
            }
        }
    }

    impl Sum for IntervalDuration {
        fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
            iter.fold(Self::ZERO, Add::add)
        }
    }

    /// Renders as `H:MM`, the way Org prints clock sums.
    impl fmt::Display for IntervalDuration {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Seconds(s) => {
                    let minutes = s / 60;
                    write!(f, "{}:{:02}", minutes / 60, minutes % 60)
                }
                Self::Undefined => f.write_str("-:--"),
            }
        }
    }

    /// A time range that includes `start` and excludes `end`.
    ///
    /// A missing bound means the interval is open on that side. An interval whose
    /// start equals its end is empty. Equality is structural: two intervals are
    /// equal if their starts and ends are equal, absence included.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TimeInterval {
        pub start: Option<NaiveDateTime>,
        pub end: Option<NaiveDateTime>,
    }

    impl TimeInterval {
        pub fn new(start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Self {
            Self { start, end }
        }

        pub fn closed(start: NaiveDateTime, end: NaiveDateTime) -> Self {
            Self::new(Some(start), Some(end))
        }

        pub fn starting_at(start: NaiveDateTime) -> Self {
            Self::new(Some(start), None)
        }

        pub fn ending_at(end: NaiveDateTime) -> Self {
            Self::new(None, Some(end))
        }

        /// Midnight of `start` up to (excluding) midnight of `end`.
        pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Self {
            Self::closed(start.and_time(NaiveTime::MIN), end.and_time(NaiveTime::MIN))
        }

        /// The whole calendar day `date`.
        pub fn day(date: NaiveDate) -> Self {
            match date.succ_opt() {
                Some(next) => Self::from_dates(date, next),
                None => Self::starting_at(date.and_time(NaiveTime::MIN)),
            }
        }

        /// Valid if start <= end when both are defined, or if exactly one bound is defined.
        /// The fully unbounded interval is invalid.
        pub fn is_valid(&self) -> bool {
            match (self.start, self.end) {
                (Some(start), Some(end)) => start <= end,
                (None, None) => false,
                _ => true,
            }
        }

        pub fn is_empty(&self) -> bool {
            matches!((self.start, self.end), (Some(start), Some(end)) if start == end)
        }

        /// The common part of two intervals.
        ///
        /// Examples, with a < b < c < d and `*` for an open side:
        ///
        /// - `[a, c) ∩ [b, d) = [b, c)`
        /// - `[*, c) ∩ [b, *) = [b, c)`
        /// - `[b, *) ∩ [c, *) = [c, *)`
        /// - `[a, b) ∩ [c, d) = [c, c)`, empty at the later start
        /// - `[a, b) ∩ [b, c) = [b, b)`
        /// - anything ∩ an invalid interval = `[*, *)`
        pub fn intersection(&self, other: &Self) -> Self {
            if !self.is_valid() || !other.is_valid() {
                return Self::default();
            }
            // None sorts before Some, so max() picks the later defined start.
            let start = self.start.max(other.start);
            let end = match (self.end, other.end) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match (start, end) {
                (Some(start), Some(end)) if start >= end => Self::closed(start, start),
                _ => Self { start, end },
            }
        }

        /// Zero for an empty interval, `Undefined` if a side is open (or the interval is
        /// invalid), otherwise the whole seconds from start to end.
        pub fn duration(&self) -> IntervalDuration {
            match (self.start, self.end) {
                (Some(start), Some(end)) if start <= end => {
                    IntervalDuration::Seconds((end - start).num_seconds())
                }
                _ => IntervalDuration::Undefined,
            }
        }
    }

    impl fmt::Display for TimeInterval {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fn bound(f: &mut fmt::Formatter<'_>, value: Option<NaiveDateTime>) -> fmt::Result {
                match value {
                    Some(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M")),
                    None => f.write_str("*"),
                }
            }
            f.write_str("[")?;
            bound(f, self.start)?;
            f.write_str(", ")?;
            bound(f, self.end)?;
            f.write_str(")")
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn at(hour: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2015, 4, 24)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap()
        }

        #[test]
        fn overlapping_intervals_intersect_in_both_orders() {
            let six_to_eight = TimeInterval::closed(at(6), at(8));
            let seven_to_nine = TimeInterval::closed(at(7), at(9));
            let seven_to_eight = TimeInterval::closed(at(7), at(8));
            assert_eq!(six_to_eight.intersection(&seven_to_nine), seven_to_eight);
            assert_eq!(seven_to_nine.intersection(&six_to_eight), seven_to_eight);
        }

        #[test]
        fn open_sides_take_the_other_bound() {
            let to_eight = TimeInterval::ending_at(at(8));
            let from_seven = TimeInterval::starting_at(at(7));
            let seven_to_eight = TimeInterval::closed(at(7), at(8));
            assert_eq!(to_eight.intersection(&from_seven), seven_to_eight);
            assert_eq!(from_seven.intersection(&to_eight), seven_to_eight);

            let from_six = TimeInterval::starting_at(at(6));
            assert_eq!(from_six.intersection(&from_seven), from_seven);
            let to_nine = TimeInterval::ending_at(at(9));
            assert_eq!(to_eight.intersection(&to_nine), to_eight);
        }

        #[test]
        fn disjoint_intervals_are_empty_at_the_later_start() {
            let six_to_seven = TimeInterval::closed(at(6), at(7));
            let eight_to_nine = TimeInterval::closed(at(8), at(9));
            let empty = TimeInterval::closed(at(8), at(8));
            assert_eq!(six_to_seven.intersection(&eight_to_nine), empty);
            assert_eq!(eight_to_nine.intersection(&six_to_seven), empty);
            assert!(empty.is_empty());
            assert_eq!(empty.duration(), IntervalDuration::ZERO);
        }

        #[test]
        fn touching_intervals_are_empty_at_the_touch_point() {
            let six_to_seven = TimeInterval::closed(at(6), at(7));
            let seven_to_eight = TimeInterval::closed(at(7), at(8));
            let touch = TimeInterval::closed(at(7), at(7));
            assert_eq!(six_to_seven.intersection(&seven_to_eight), touch);
            assert_eq!(seven_to_eight.intersection(&six_to_seven), touch);
        }

        #[test]
        fn invalid_operands_give_an_invalid_result() {
            let six_to_eight = TimeInterval::closed(at(6), at(8));
            let unbounded = TimeInterval::default();
            assert_eq!(six_to_eight.intersection(&unbounded), TimeInterval::default());
            assert_eq!(unbounded.intersection(&six_to_eight), TimeInterval::default());
            assert_eq!(unbounded.intersection(&unbounded), TimeInterval::default());
            assert!(!six_to_eight.intersection(&unbounded).is_valid());

            let inverted = TimeInterval::closed(at(9), at(6));
            assert!(!inverted.is_valid());
            assert_eq!(inverted.intersection(&six_to_eight), TimeInterval::default());
        }

        #[test]
        fn validity_rules() {
            assert!(TimeInterval::closed(at(6), at(6)).is_valid());
            assert!(TimeInterval::starting_at(at(6)).is_valid());
            assert!(TimeInterval::ending_at(at(6)).is_valid());
            assert!(!TimeInterval::default().is_valid());
        }

        #[test]
        fn durations() {
            assert_eq!(
                TimeInterval::closed(at(6), at(8)).duration(),
                IntervalDuration::Seconds(7200)
            );
            assert_eq!(
                TimeInterval::starting_at(at(6)).duration(),
                IntervalDuration::Undefined
            );
            assert_eq!(TimeInterval::default().duration(), IntervalDuration::Undefined);
            assert_eq!(
                TimeInterval::closed(at(8), at(6)).duration(),
                IntervalDuration::Undefined
            );
        }

        #[test]
        fn undefined_absorbs_sums() {
            let total: IntervalDuration = [
                IntervalDuration::Seconds(60),
                IntervalDuration::Undefined,
                IntervalDuration::Seconds(60),
            ]
            .into_iter()
            .sum();
            assert_eq!(total, IntervalDuration::Undefined);
            assert_eq!(
                IntervalDuration::Seconds(60) + IntervalDuration::Seconds(90),
                IntervalDuration::Seconds(150)
            );
        }

        #[test]
        fn day_covers_midnight_to_midnight() {
            let date = NaiveDate::from_ymd_opt(2015, 3, 26).unwrap();
            let day = TimeInterval::day(date);
            assert_eq!(day.duration(), IntervalDuration::Seconds(24 * 3600));
            assert_eq!(day.start, date.and_hms_opt(0, 0, 0));
        }

        #[test]
        fn display_forms() {
            assert_eq!(IntervalDuration::Seconds(5400).to_string(), "1:30");
            assert_eq!(IntervalDuration::Undefined.to_string(), "-:--");
            assert_eq!(
                TimeInterval::starting_at(at(6)).to_string(),
                "[2015-04-24 06:00, *)"
            );
        }
    }
}

pub mod core {
    //! Element tree model.
    //!
    //! Every node of a parsed document lives in an [`OrgTree`] arena and is addressed by
    //! an [`ElementId`]. A node owns its children through an ordered id list and knows its
    //! parent through a plain back-reference; ownership always flows root to leaf.

    use crate::interval::{IntervalDuration, TimeInterval};
    use chrono::NaiveDateTime;
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeSet, fmt};
    use uuid::Uuid;

    /// Drawer name that is always recognized and holds properties.
    pub const PROPERTIES_DRAWER: &str = "PROPERTIES";

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OrgFileId(pub Uuid);

    impl OrgFileId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for OrgFileId {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Stable index of an element inside its [`OrgTree`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ElementId(pub usize);

    /* ---------------------------- Value Objects ---------------------------- */

    /// Tag wrapper; tags compare by their exact text.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Tag(pub String);

    impl Tag {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Operation {
        /// `KEY` replaces any inherited value.
        Define,
        /// `KEY+` appends to the inherited value, separated by one space.
        Add,
    }

    /// A key/value fact with Define/Add semantics.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Property {
        pub key: String,
        pub value: String,
        pub operation: Operation,
    }

    impl Property {
        pub fn new(key: impl Into<String>, value: impl Into<String>, operation: Operation) -> Self {
            Self {
                key: key.into(),
                value: value.into(),
                operation,
            }
        }

        pub fn define(key: impl Into<String>, value: impl Into<String>) -> Self {
            Self::new(key, value, Operation::Define)
        }

        pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
            Self::new(key, value, Operation::Add)
        }

        pub fn is_valid(&self) -> bool {
            !self.key.is_empty()
        }

        /// Fold `token` into this running value.
        pub fn apply(&mut self, token: &Property) {
            self.key.clone_from(&token.key);
            match token.operation {
                Operation::Define => self.value.clone_from(&token.value),
                Operation::Add => {
                    self.value.push(' ');
                    self.value.push_str(&token.value);
                }
            }
        }
    }

    impl fmt::Display for Property {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let marker = match self.operation {
                Operation::Define => "",
                Operation::Add => "+",
            };
            write!(f, "{}{}: {}", self.key, marker, self.value)
        }
    }

    /// Key and value of a `#+KEY: value` line.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct KeyValue {
        pub key: String,
        pub value: String,
    }

    /* ------------------------------ Payloads ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Headline {
        /// Number of leading `*`.
        pub level: usize,
        /// Title without the stars and without the trailing tag block.
        pub caption: String,
        #[serde(default)]
        pub tags: BTreeSet<Tag>,
    }

    impl Headline {
        pub fn has_own_tag(&self, tag: &str) -> bool {
            self.tags.iter().any(|t| t.0 == tag)
        }
    }

    impl fmt::Display for Headline {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "[{}] {}", self.level, self.caption)?;
            if !self.tags.is_empty() {
                f.write_str(" :")?;
                for tag in &self.tags {
                    write!(f, "{}:", tag.0)?;
                }
            }
            Ok(())
        }
    }

    /// A `CLOCK:` entry. Missing or unreadable timestamps leave the bound open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ClockLine {
        pub start: Option<NaiveDateTime>,
        pub end: Option<NaiveDateTime>,
        /// The `=> H:MM` sum written by Org, in minutes. Display only.
        pub recorded_minutes: Option<i64>,
    }

    impl ClockLine {
        pub fn interval(&self) -> TimeInterval {
            TimeInterval::new(self.start, self.end)
        }

        pub fn duration(&self) -> IntervalDuration {
            self.interval().duration()
        }
    }

    /// Variant discriminator used by the searches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ElementKind {
        OrgFile,
        Headline,
        OrgLine,
        FileAttributeLine,
        ClockLine,
        Drawer,
        DrawerEntry,
        PropertyDrawer,
        PropertyDrawerEntry,
        DrawerClosingEntry,
    }

    impl ElementKind {
        pub fn mnemonic(self) -> &'static str {
            match self {
                Self::OrgFile => "OrgFile",
                Self::Headline => "Headline",
                Self::OrgLine => "Line",
                Self::FileAttributeLine => "FileAttr",
                Self::ClockLine => "Clock",
                Self::Drawer => "Drawer",
                Self::DrawerEntry => "DrawerEntry",
                Self::PropertyDrawer => "PropertyDrawer",
                Self::PropertyDrawerEntry => "Property",
                Self::DrawerClosingEntry => "DrawerEnd",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ElementData {
        OrgFile { id: OrgFileId, name: String },
        Headline(Headline),
        OrgLine,
        FileAttributeLine(KeyValue),
        ClockLine(ClockLine),
        Drawer { name: String },
        DrawerEntry(Property),
        PropertyDrawer,
        PropertyDrawerEntry(Property),
        DrawerClosingEntry,
    }

    impl ElementData {
        pub fn kind(&self) -> ElementKind {
            match self {
                Self::OrgFile { .. } => ElementKind::OrgFile,
                Self::Headline(_) => ElementKind::Headline,
                Self::OrgLine => ElementKind::OrgLine,
                Self::FileAttributeLine(_) => ElementKind::FileAttributeLine,
                Self::ClockLine(_) => ElementKind::ClockLine,
                Self::Drawer { .. } => ElementKind::Drawer,
                Self::DrawerEntry(_) => ElementKind::DrawerEntry,
                Self::PropertyDrawer => ElementKind::PropertyDrawer,
                Self::PropertyDrawerEntry(_) => ElementKind::PropertyDrawerEntry,
                Self::DrawerClosingEntry => ElementKind::DrawerClosingEntry,
            }
        }
    }

    /* ------------------------------ Elements ------------------------------ */

    /// One node of the tree: the verbatim source line (terminator included) plus its payload.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Element {
        raw: String,
        data: ElementData,
        parent: Option<ElementId>,
        #[serde(default)]
        children: Vec<ElementId>,
    }

    impl Element {
        pub fn new(data: ElementData, raw: impl Into<String>) -> Self {
            Self {
                raw: raw.into(),
                data,
                parent: None,
                children: vec![],
            }
        }

        pub fn kind(&self) -> ElementKind {
            self.data.kind()
        }

        pub fn data(&self) -> &ElementData {
            &self.data
        }

        /// The source line exactly as read, including its line terminator.
        pub fn raw(&self) -> &str {
            &self.raw
        }

        /// The source line without its terminator.
        pub fn line(&self) -> &str {
            strip_line_ending(&self.raw)
        }

        pub fn parent(&self) -> Option<ElementId> {
            self.parent
        }

        pub fn children(&self) -> &[ElementId] {
            &self.children
        }

        pub fn is_valid(&self) -> bool {
            match &self.data {
                ElementData::Headline(h) => h.level >= 1,
                ElementData::FileAttributeLine(kv) => !kv.key.is_empty() && !kv.value.is_empty(),
                ElementData::ClockLine(c) => c.start.is_some() && c.interval().is_valid(),
                ElementData::Drawer { name } => !name.is_empty(),
                ElementData::PropertyDrawerEntry(p) => p.is_valid(),
                ElementData::OrgFile { .. }
                | ElementData::OrgLine
                | ElementData::DrawerEntry(_)
                | ElementData::PropertyDrawer
                | ElementData::DrawerClosingEntry => true,
            }
        }

        /// Headlines match on their caption, everything else on the line text.
        pub fn is_match(&self, pattern: &Regex) -> bool {
            match &self.data {
                ElementData::Headline(h) => pattern.is_match(&h.caption),
                _ => pattern.is_match(self.line()),
            }
        }

        pub fn as_headline(&self) -> Option<&Headline> {
            match &self.data {
                ElementData::Headline(h) => Some(h),
                _ => None,
            }
        }

        pub fn as_clock(&self) -> Option<&ClockLine> {
            match &self.data {
                ElementData::ClockLine(c) => Some(c),
                _ => None,
            }
        }

        pub fn as_file_attribute(&self) -> Option<&KeyValue> {
            match &self.data {
                ElementData::FileAttributeLine(kv) => Some(kv),
                _ => None,
            }
        }

        /// The entry of a property drawer or any other drawer.
        pub fn as_property(&self) -> Option<&Property> {
            match &self.data {
                ElementData::PropertyDrawerEntry(p) | ElementData::DrawerEntry(p) => Some(p),
                _ => None,
            }
        }

        pub fn drawer_name(&self) -> Option<&str> {
            match &self.data {
                ElementData::Drawer { name } => Some(name),
                ElementData::PropertyDrawer => Some(PROPERTIES_DRAWER),
                _ => None,
            }
        }

        fn description(&self) -> String {
            match &self.data {
                ElementData::OrgFile { name, .. } => name.clone(),
                ElementData::Headline(h) => h.to_string(),
                ElementData::OrgLine => self.line().to_string(),
                ElementData::FileAttributeLine(kv) => format!("{}: {}", kv.key, kv.value),
                ElementData::ClockLine(c) => format!("{} => {}", c.interval(), c.duration()),
                ElementData::Drawer { name } => name.clone(),
                ElementData::DrawerEntry(p) | ElementData::PropertyDrawerEntry(p) => p.to_string(),
                ElementData::PropertyDrawer => PROPERTIES_DRAWER.to_string(),
                ElementData::DrawerClosingEntry => String::new(),
            }
        }
    }

    pub(crate) fn strip_line_ending(line: &str) -> &str {
        match line.strip_suffix('\n') {
            Some(l) => l.strip_suffix('\r').unwrap_or(l),
            None => line,
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: an arena holding one parsed document. Index 0 is the `OrgFile` root.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OrgTree {
        nodes: Vec<Element>,
    }

    impl OrgTree {
        /// A tree holding only the synthetic `OrgFile` root, whose line is empty.
        pub fn new(name: impl Into<String>) -> Self {
            let root = Element::new(
                ElementData::OrgFile {
                    id: OrgFileId::new(),
                    name: name.into(),
                },
                String::new(),
            );
            Self { nodes: vec![root] }
        }

        pub fn root(&self) -> ElementId {
            ElementId(0)
        }

        pub fn name(&self) -> &str {
            match &self.nodes[0].data {
                ElementData::OrgFile { name, .. } => name,
                _ => "",
            }
        }

        pub fn element_count(&self) -> usize {
            self.nodes.len()
        }

        /// Panics if `id` was not handed out by this tree.
        pub fn get(&self, id: ElementId) -> &Element {
            &self.nodes[id.0]
        }

        /// Allocate a detached element; attach it with [`OrgTree::add_child`].
        pub fn alloc(&mut self, data: ElementData, raw: impl Into<String>) -> ElementId {
            self.nodes.push(Element::new(data, raw));
            ElementId(self.nodes.len() - 1)
        }

        /// Append `child` to `parent`'s children and point it back at `parent`.
        ///
        /// There is no cycle check: callers must never attach an ancestor below one
        /// of its descendants.
        pub fn add_child(&mut self, parent: ElementId, child: ElementId) {
            debug_assert!(self.nodes[child.0].parent.is_none(), "element already attached");
            self.nodes[child.0].parent = Some(parent);
            self.nodes[parent.0].children.push(child);
        }

        pub fn insert(
            &mut self,
            parent: ElementId,
            data: ElementData,
            raw: impl Into<String>,
        ) -> ElementId {
            let id = self.alloc(data, raw);
            self.add_child(parent, id);
            id
        }

        pub fn parent(&self, id: ElementId) -> Option<ElementId> {
            self.get(id).parent
        }

        pub fn children(&self, id: ElementId) -> &[ElementId] {
            &self.get(id).children
        }

        /// `id` itself, then each parent up to the root.
        pub fn ancestors(&self, id: ElementId) -> Ancestors<'_> {
            Ancestors {
                tree: self,
                next: Some(id),
            }
        }

        /// Nesting level from the position in the tree; the root is 0.
        pub fn depth(&self, id: ElementId) -> usize {
            self.ancestors(id).count() - 1
        }

        /// Closest element of `kind` among `id` and its ancestors.
        pub fn nearest(&self, id: ElementId, kind: ElementKind) -> Option<ElementId> {
            self.ancestors(id).find(|&a| self.get(a).kind() == kind)
        }

        /// Depth-first pre-order walk below `root`, yielding each id with its depth
        /// relative to `root`.
        pub fn pre_order(&self, root: ElementId) -> PreOrder<'_> {
            PreOrder {
                tree: self,
                stack: vec![(root, 0)],
                max_depth: None,
            }
        }

        /// First element of `kind` (pre-order) for which `predicate` holds.
        pub fn find_first<P>(&self, root: ElementId, kind: ElementKind, predicate: P) -> Option<ElementId>
        where
            P: Fn(&Element) -> bool,
        {
            self.pre_order(root).map(|(id, _)| id).find(|&id| {
                let element = self.get(id);
                element.kind() == kind && predicate(element)
            })
        }

        pub fn find_element(&self, root: ElementId, kind: ElementKind, pattern: &Regex) -> Option<ElementId> {
            self.find_first(root, kind, |e| e.is_match(pattern))
        }

        /// All elements of `kind` for which `predicate` holds, at most `max_depth` levels
        /// below `root` (`None` walks the whole subtree, `Some(0)` checks `root` only).
        pub fn find_all<P>(
            &self,
            root: ElementId,
            kind: ElementKind,
            max_depth: Option<usize>,
            predicate: P,
        ) -> Vec<ElementId>
        where
            P: Fn(&Element) -> bool,
        {
            let walk = PreOrder {
                tree: self,
                stack: vec![(root, 0)],
                max_depth,
            };
            walk.map(|(id, _)| id)
                .filter(|&id| {
                    let element = self.get(id);
                    element.kind() == kind && predicate(element)
                })
                .collect()
        }

        /// Indented, one line per element dump of the subtree. Diagnostic only.
        pub fn describe(&self, root: ElementId) -> String {
            use std::fmt::Write;
            let mut out = String::new();
            for (id, depth) in self.pre_order(root) {
                let element = self.get(id);
                let _ = writeln!(
                    out,
                    "{}{}: {}",
                    "  ".repeat(depth),
                    element.kind().mnemonic(),
                    element.description()
                );
            }
            out
        }
    }

    pub struct Ancestors<'a> {
        tree: &'a OrgTree,
        next: Option<ElementId>,
    }

    impl Iterator for Ancestors<'_> {
        type Item = ElementId;

        fn next(&mut self) -> Option<ElementId> {
            let current = self.next?;
            self.next = self.tree.get(current).parent;
            Some(current)
        }
    }

    pub struct PreOrder<'a> {
        tree: &'a OrgTree,
        stack: Vec<(ElementId, usize)>,
        max_depth: Option<usize>,
    }

    impl Iterator for PreOrder<'_> {
        type Item = (ElementId, usize);

        fn next(&mut self) -> Option<Self::Item> {
            let (id, depth) = self.stack.pop()?;
            if self.max_depth.is_none_or(|max| depth < max) {
                let children = self.tree.children(id);
                self.stack
                    .extend(children.iter().rev().map(|&child| (child, depth + 1)));
            }
            Some((id, depth))
        }
    }

}

pub mod storage {
    use super::core::OrgTree;
    use super::error::Result;
    use std::path::Path;

    /// Loads documents from disk; parsing itself is independent of where text comes from.
    pub trait OrgParser {
        fn parse_file(&self, abs_path: &Path) -> Result<OrgTree>;
    }
}

pub mod parser {
    //! Two-pass, line-oriented Org parser.
    //!
    //! Pass 1 scans every line for `#+KEY: value` declarations and gathers them into
    //! [`FileSettings`]; the drawer allowlist comes from `#+DRAWERS:` wherever it appears
    //! in the file. Pass 2 classifies each line into an element and attaches it under the
    //! open drawer, the current headline, or the root. A line that fits no specific
    //! classification becomes a plain line, so parsing never fails on content.

    use crate::core::*;
    use crate::error::{OrgError, Result};
    use crate::storage::OrgParser;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1, take_while1, take_while_m_n},
        character::complete::{char, digit1, not_line_ending, space0, space1},
        combinator::{all_consuming, map, map_res, opt, recognize, rest},
        error::VerboseError,
        multi::many1,
        sequence::{delimited, preceded, tuple},
    };
    use serde::Serialize;
    use std::{
        collections::BTreeSet,
        fs,
        io::{BufRead, BufReader},
        path::Path,
    };
    use tracing::{debug, trace};

    /// File attribute that extends the drawer allowlist.
    pub const DRAWERS_KEY: &str = "DRAWERS";

    /* ---------------------------- Pass 1 result ---------------------------- */

    /// File-level declarations that condition classification in pass 2.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct FileSettings {
        /// Every `#+KEY: value` line, grouped by key in first-seen order.
        pub attributes: IndexMap<String, Vec<String>>,
        /// `PROPERTIES` plus the names declared by every `#+DRAWERS:` line.
        pub drawer_names: BTreeSet<String>,
    }

    impl Default for FileSettings {
        fn default() -> Self {
            Self {
                attributes: IndexMap::new(),
                drawer_names: BTreeSet::from([PROPERTIES_DRAWER.to_string()]),
            }
        }
    }

    impl FileSettings {
        /// Pass 1: one full scan recognizing file attributes.
        pub fn scan<'a, I>(lines: I) -> Self
        where
            I: IntoIterator<Item = &'a str>,
        {
            let mut settings = Self::default();
            for line in lines {
                let Some(attr) = parse_file_attribute(strip_line_ending(line)) else {
                    continue;
                };
                if attr.key == DRAWERS_KEY {
                    settings
                        .drawer_names
                        .extend(attr.value.split_whitespace().map(str::to_string));
                }
                settings.attributes.entry(attr.key).or_default().push(attr.value);
            }
            settings
        }

        pub fn is_drawer_name(&self, name: &str) -> bool {
            self.drawer_names.contains(name)
        }

        /// First value declared for `key`.
        pub fn attribute(&self, key: &str) -> Option<&str> {
            self.attributes
                .get(key)
                .and_then(|values| values.first())
                .map(String::as_str)
        }
    }

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a document from a reader. Only a failing reader (or invalid UTF-8) errors.
    pub fn parse<R: BufRead>(mut reader: R, name: &str) -> Result<OrgTree> {
        let lines = read_lines(&mut reader).map_err(|e| OrgError::io(format!("reading {name}"), e))?;
        Ok(parse_lines(lines, name))
    }

    /// Parse a document held in memory.
    pub fn parse_str(input: &str, name: &str) -> OrgTree {
        parse_lines(input.split_inclusive('\n').map(str::to_string).collect(), name)
    }

    fn parse_lines(lines: Vec<String>, name: &str) -> OrgTree {
        let settings = FileSettings::scan(lines.iter().map(String::as_str));
        debug!(
            file = name,
            lines = lines.len(),
            attributes = settings.attributes.len(),
            drawers = ?settings.drawer_names,
            "pass 1 complete"
        );
        build_tree(lines, name, &settings)
    }

    /// Pass 2: build the tree from `lines` under the given settings.
    pub fn build_tree(lines: Vec<String>, name: &str, settings: &FileSettings) -> OrgTree {
        let mut builder = TreeBuilder::new(name, settings);
        let mut source = LineSource::new(lines);
        while let Some(line) = source.next_line() {
            if let Some(again) = builder.push_line(line) {
                source.unget(again);
            }
        }
        builder.finish()
    }

    fn read_lines<R: BufRead>(reader: &mut R) -> std::io::Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// Concrete parser implementing the `storage::OrgParser` trait.
    pub struct NomOrgParser;

    impl OrgParser for NomOrgParser {
        fn parse_file(&self, abs_path: &Path) -> Result<OrgTree> {
            let file = fs::File::open(abs_path)
                .map_err(|e| OrgError::io(format!("opening {:?}", abs_path), e))?;
            debug!(path = ?abs_path, "parsing file");
            parse(BufReader::new(file), &abs_path.display().to_string())
        }
    }

    /* ---------------------------- Line source ---------------------------- */

    /// Lines in order, with room to push a line back for another look.
    struct LineSource {
        lines: std::vec::IntoIter<String>,
        pushed_back: Vec<String>,
    }

    impl LineSource {
        fn new(lines: Vec<String>) -> Self {
            Self {
                lines: lines.into_iter(),
                pushed_back: Vec::new(),
            }
        }

        fn next_line(&mut self) -> Option<String> {
            self.pushed_back.pop().or_else(|| self.lines.next())
        }

        fn unget(&mut self, line: String) {
            self.pushed_back.push(line);
        }
    }

    /* ---------------------------- Tree builder ---------------------------- */

    struct OpenDrawer {
        id: ElementId,
        properties: bool,
    }

    struct TreeBuilder<'s> {
        tree: OrgTree,
        settings: &'s FileSettings,
        /// Open headlines by level; the last one is the insertion point.
        headlines: Vec<(usize, ElementId)>,
        drawer: Option<OpenDrawer>,
    }

    impl<'s> TreeBuilder<'s> {
        fn new(name: &str, settings: &'s FileSettings) -> Self {
            Self {
                tree: OrgTree::new(name),
                settings,
                headlines: Vec::new(),
                drawer: None,
            }
        }

        fn insertion_point(&self) -> ElementId {
            self.headlines
                .last()
                .map(|&(_, id)| id)
                .unwrap_or_else(|| self.tree.root())
        }

        /// Consume one line. Returns the line when it has to be read again.
        fn push_line(&mut self, raw: String) -> Option<String> {
            let text = strip_line_ending(&raw);

            if let Some(headline) = parse_headline(text) {
                if let Some(drawer) = self.drawer.take() {
                    debug!(drawer = drawer.id.0, "headline closes unterminated drawer");
                    return Some(raw);
                }
                while self
                    .headlines
                    .last()
                    .is_some_and(|&(level, _)| level >= headline.level)
                {
                    self.headlines.pop();
                }
                let level = headline.level;
                let parent = self.insertion_point();
                trace!(level, caption = %headline.caption, "headline");
                let id = self.tree.insert(parent, ElementData::Headline(headline), raw);
                self.headlines.push((level, id));
                return None;
            }

            let data = self.classify(text);
            trace!(kind = ?data.kind(), line = text, "classified");
            let container = match &self.drawer {
                Some(drawer) => drawer.id,
                None => self.insertion_point(),
            };
            let kind = data.kind();
            let id = self.tree.insert(container, data, raw);
            match kind {
                ElementKind::Drawer | ElementKind::PropertyDrawer => {
                    self.drawer = Some(OpenDrawer {
                        id,
                        properties: kind == ElementKind::PropertyDrawer,
                    });
                }
                ElementKind::DrawerClosingEntry => self.drawer = None,
                _ => {}
            }
            None
        }

        /// Classification order: file attribute, clock, drawer open, drawer close,
        /// drawer entry, plain line.
        fn classify(&self, text: &str) -> ElementData {
            if let Some(attr) = parse_file_attribute(text) {
                return ElementData::FileAttributeLine(attr);
            }
            if let Some(clock) = parse_clock_line(text) {
                return ElementData::ClockLine(clock);
            }
            match &self.drawer {
                None => {
                    if let Some(name) = parse_drawer_marker(text) {
                        if name == PROPERTIES_DRAWER {
                            return ElementData::PropertyDrawer;
                        }
                        if self.settings.is_drawer_name(name) {
                            return ElementData::Drawer {
                                name: name.to_string(),
                            };
                        }
                    }
                }
                Some(drawer) => {
                    if is_drawer_end(text) {
                        return ElementData::DrawerClosingEntry;
                    }
                    if let Some(entry) = parse_drawer_entry(text) {
                        return if drawer.properties {
                            ElementData::PropertyDrawerEntry(entry)
                        } else {
                            ElementData::DrawerEntry(entry)
                        };
                    }
                }
            }
            ElementData::OrgLine
        }

        fn finish(self) -> OrgTree {
            if let Some(drawer) = &self.drawer {
                debug!(drawer = drawer.id.0, "document ends inside an open drawer");
            }
            debug!(
                file = self.tree.name(),
                elements = self.tree.element_count(),
                "pass 2 complete"
            );
            self.tree
        }
    }

    /* ----------------------------- Classifiers ----------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn is_tag_char(c: char) -> bool {
        // conservative subset for tags; Org is more lenient.
        c.is_alphanumeric() || matches!(c, '_' | '-' | '@' | '+' | '#' | '%')
    }

    pub(crate) fn parse_headline(text: &str) -> Option<Headline> {
        headline(text).ok().map(|(_, h)| h)
    }

    fn headline(i: &str) -> PResult<'_, Headline> {
        let (i, stars) = recognize(many1(char('*')))(i)?;
        let (i, _) = space1(i)?;
        let (caption, tags) = split_tags(i.trim_end());
        Ok((
            "",
            Headline {
                level: stars.len(),
                caption: caption.to_string(),
                tags,
            },
        ))
    }

    /// Split a trailing `:a:b:` block off a headline title.
    fn split_tags(title: &str) -> (&str, BTreeSet<Tag>) {
        let (head, trail) = match title.rfind(char::is_whitespace) {
            Some(pos) => (&title[..pos], title[pos..].trim_start()),
            None => ("", title),
        };
        if trail.len() > 2 && trail.starts_with(':') && trail.ends_with(':') {
            let parts: Vec<&str> = trail[1..trail.len() - 1].split(':').collect();
            if parts.iter().all(|p| !p.is_empty() && p.chars().all(is_tag_char)) {
                return (head.trim_end(), parts.into_iter().map(Tag::from).collect());
            }
        }
        (title, BTreeSet::new())
    }

    /// Tags from a `:a:b:c:` list such as the value of `#+FILETAGS:`.
    pub(crate) fn parse_colon_tags(s: &str) -> Vec<Tag> {
        s.split(':')
            .map(str::trim)
            .filter(|part| !part.is_empty() && part.chars().all(is_tag_char))
            .map(Tag::from)
            .collect()
    }

    pub(crate) fn parse_file_attribute(text: &str) -> Option<KeyValue> {
        hash_key_value(text).ok().map(|(_, kv)| kv)
    }

    fn hash_key_value(i: &str) -> PResult<'_, KeyValue> {
        // #+key: value
        map(
            tuple((
                tag("#+"),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                tag(":"),
                space0,
                not_line_ending,
            )),
            |(_, key, _, _, value): (&str, &str, &str, &str, &str)| KeyValue {
                key: key.to_string(),
                value: value.trim_end().to_string(),
            },
        )(i)
    }

    /// `KEY VALUE` or `KEY+ VALUE`, the payload of a `#+PROPERTY:` line.
    pub(crate) fn parse_property_declaration(value: &str) -> Option<Property> {
        let (_, (key, value)) = tuple((
            take_till1::<_, _, VerboseError<&str>>(char::is_whitespace),
            rest,
        ))(value.trim())
        .ok()?;
        Some(make_property(key, value.trim()))
    }

    fn make_property(key: &str, value: &str) -> Property {
        match key.strip_suffix('+') {
            Some(base) if !base.is_empty() => Property::add(base, value),
            _ => Property::define(key, value),
        }
    }

    fn parse_clock_line(text: &str) -> Option<ClockLine> {
        let (body, _) = clock_keyword(text).ok()?;
        Some(clock_body(body).map(|(_, c)| c).unwrap_or_default())
    }

    fn clock_keyword(i: &str) -> PResult<'_, &str> {
        preceded(space0, tag("CLOCK:"))(i)
    }

    fn clock_body(i: &str) -> PResult<'_, ClockLine> {
        // [2015-03-26 Thu 10:00]--[2015-03-26 Thu 11:30] =>  1:30
        let (i, _) = space0(i)?;
        let (i, start) = opt(parse_timestamp)(i)?;
        let (i, end) = opt(preceded(delimited(space0, tag("--"), space0), parse_timestamp))(i)?;
        let (i, recorded_minutes) = opt(parse_clock_minutes)(i)?;
        Ok((
            i,
            ClockLine {
                start,
                end,
                recorded_minutes,
            },
        ))
    }

    fn parse_clock_minutes(i: &str) -> PResult<'_, i64> {
        // " => H:MM"
        let (i, _) = space0(i)?;
        let (i, _) = tag("=>")(i)?;
        let (i, _) = space0(i)?;
        let (i, hours) = map_res(digit1, |s: &str| s.parse::<i64>())(i)?;
        let (i, _) = char(':')(i)?;
        let (i, mins) = map_res(digit1, |s: &str| s.parse::<i64>())(i)?;
        Ok((i, hours * 60 + mins))
    }

    fn parse_drawer_marker(text: &str) -> Option<&str> {
        // :NAME:
        let marker: PResult<'_, &str> = all_consuming(delimited(
            char(':'),
            take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
            char(':'),
        ))(text.trim());
        marker.ok().map(|(_, name)| name)
    }

    fn is_drawer_end(text: &str) -> bool {
        text.trim() == ":END:"
    }

    fn parse_drawer_entry(text: &str) -> Option<Property> {
        drawer_entry(text).ok().map(|(_, p)| p)
    }

    fn drawer_entry(i: &str) -> PResult<'_, Property> {
        //  :KEY: value
        let (i, _) = space0(i)?;
        let (i, key) = delimited(
            char(':'),
            take_while1(|c: char| c != ':' && !c.is_whitespace()),
            char(':'),
        )(i)?;
        let (i, value) = alt((preceded(space1, rest), all_consuming(space0)))(i)?;
        Ok((i, make_property(key, value.trim())))
    }

    /* ----------------------------- Timestamps ----------------------------- */

    fn parse_timestamp(i: &str) -> PResult<'_, NaiveDateTime> {
        // Active: <YYYY-MM-DD [Day] [HH:MM]>
        // Inactive: [YYYY-MM-DD [Day] [HH:MM]]
        let (i, _) = alt((char('['), char('<')))(i)?;
        let (i, date) = parse_date(i)?;
        let (i, _) = opt(preceded(
            space1,
            take_while1(|c: char| c.is_alphabetic() || c == '.'),
        ))(i)?;
        let (i, time) = opt(preceded(space1, parse_time))(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = alt((char(']'), char('>')))(i)?;
        Ok((i, date.and_time(time.unwrap_or(NaiveTime::MIN))))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

}

pub mod format {
    //! Writer: the inverse of the parser. Emits every stored line in pre-order and
    //! nothing else.

    use crate::core::OrgTree;
    use crate::error::{OrgError, Result};
    use std::io::Write;

    pub fn write<W: Write>(mut sink: W, tree: &OrgTree) -> Result<()> {
        for (id, _) in tree.pre_order(tree.root()) {
            sink.write_all(tree.get(id).raw().as_bytes())
                .map_err(|e| OrgError::io(format!("writing {}", tree.name()), e))?;
        }
        sink.flush()
            .map_err(|e| OrgError::io(format!("flushing {}", tree.name()), e))
    }

    pub fn write_string(tree: &OrgTree) -> String {
        let mut out = String::new();
        for (id, _) in tree.pre_order(tree.root()) {
            out.push_str(tree.get(id).raw());
        }
        out
    }

}

pub mod attributes {
    //! Ancestor-chain queries: file attributes, drawer names, properties and tags.

    use crate::core::*;
    use crate::error::{OrgError, Result};
    use crate::parser::{DRAWERS_KEY, parse_colon_tags, parse_property_declaration};
    use std::collections::BTreeSet;

    pub const PROPERTY_KEY: &str = "PROPERTY";
    pub const FILETAGS_KEY: &str = "FILETAGS";

    /// Every file attribute of the file that contains `element`, in document order.
    /// Empty when `element` is not inside an `OrgFile`.
    pub fn all_file_attributes(tree: &OrgTree, element: ElementId) -> Vec<KeyValue> {
        let Some(file) = tree.nearest(element, ElementKind::OrgFile) else {
            return Vec::new();
        };
        tree.find_all(file, ElementKind::FileAttributeLine, None, |_| true)
            .into_iter()
            .filter_map(|id| tree.get(id).as_file_attribute().cloned())
            .collect()
    }

    /// All values declared for `key`; never fails.
    pub fn file_attributes(tree: &OrgTree, element: ElementId, key: &str) -> Vec<String> {
        all_file_attributes(tree, element)
            .into_iter()
            .filter(|kv| kv.key == key)
            .map(|kv| kv.value)
            .collect()
    }

    /// The first value declared for `key`.
    pub fn file_attribute(tree: &OrgTree, element: ElementId, key: &str) -> Result<String> {
        file_attributes(tree, element, key)
            .into_iter()
            .next()
            .ok_or_else(|| OrgError::NoSuchAttribute(key.to_string()))
    }

    /// `PROPERTIES` plus every name listed by the file's `#+DRAWERS:` lines.
    pub fn drawer_names(tree: &OrgTree, element: ElementId) -> BTreeSet<String> {
        let mut names = BTreeSet::from([PROPERTIES_DRAWER.to_string()]);
        for declared in file_attributes(tree, element, DRAWERS_KEY) {
            names.extend(declared.split_whitespace().map(str::to_string));
        }
        names
    }

    /// The first drawer named `name` directly below `element`.
    pub fn drawer(tree: &OrgTree, element: ElementId, name: &str) -> Result<ElementId> {
        tree.children(element)
            .iter()
            .copied()
            .find(|&child| tree.get(child).drawer_name() == Some(name))
            .ok_or_else(|| OrgError::NoSuchDrawer(name.to_string()))
    }

    /// Definitions of `key` that apply to `element`, outermost first.
    ///
    /// Per level, file-level `#+PROPERTY:` lines (at the `OrgFile` level only) come
    /// before the entries of that level's property drawers. Applying the list in order
    /// lets closer definitions override outer ones.
    pub fn property_definitions(tree: &OrgTree, element: ElementId, key: &str) -> Vec<Property> {
        let mut levels: Vec<Vec<Property>> = Vec::new();
        for ancestor in tree.ancestors(element) {
            let mut defs = Vec::new();
            if tree.get(ancestor).kind() == ElementKind::OrgFile {
                defs.extend(
                    file_attributes(tree, ancestor, PROPERTY_KEY)
                        .iter()
                        .filter_map(|value| parse_property_declaration(value))
                        .filter(|p| p.key == key),
                );
            }
            for drawer in tree.find_all(ancestor, ElementKind::PropertyDrawer, Some(1), |_| true) {
                defs.extend(
                    tree.find_all(drawer, ElementKind::PropertyDrawerEntry, Some(1), |e| {
                        e.as_property().is_some_and(|p| p.key == key)
                    })
                    .into_iter()
                    .filter_map(|id| tree.get(id).as_property().cloned()),
                );
            }
            levels.push(defs);
        }
        levels.into_iter().rev().flatten().collect()
    }

    /// Resolve `key` for `element`. `Add` with nothing inherited starts the value.
    pub fn property(tree: &OrgTree, element: ElementId, key: &str) -> Result<String> {
        let mut resolved: Option<Property> = None;
        for def in property_definitions(tree, element, key) {
            match resolved.as_mut() {
                Some(running) => running.apply(&def),
                None => resolved = Some(Property::define(def.key, def.value)),
            }
        }
        resolved
            .map(|p| p.value)
            .ok_or_else(|| OrgError::UndefinedProperty(key.to_string()))
    }

    /// Listing every property of an element is not supported yet.
    pub fn properties(_tree: &OrgTree, _element: ElementId) -> Result<Vec<Property>> {
        Err(OrgError::NotImplemented("listing all properties of an element"))
    }

    /// Own tags of every enclosing headline plus the file's `#+FILETAGS:`.
    pub fn tags(tree: &OrgTree, element: ElementId) -> BTreeSet<Tag> {
        let mut tags = BTreeSet::new();
        for id in tree.ancestors(element) {
            if let Some(headline) = tree.get(id).as_headline() {
                tags.extend(headline.tags.iter().cloned());
            }
        }
        for declared in file_attributes(tree, element, FILETAGS_KEY) {
            tags.extend(parse_colon_tags(&declared));
        }
        tags
    }

    pub fn has_tag(tree: &OrgTree, element: ElementId, tag: &str) -> bool {
        tags(tree, element).iter().any(|t| t.0 == tag)
    }

}

pub mod clock {
    //! Clocked time per headline.

    use crate::core::*;
    use crate::interval::{IntervalDuration, TimeInterval};

    /// The `CLOCK:` lines owned by `headline`: direct children and those inside its
    /// drawers, but not those of nested headlines.
    pub fn clock_entries(tree: &OrgTree, headline: ElementId) -> Vec<ElementId> {
        fn collect(tree: &OrgTree, id: ElementId, out: &mut Vec<ElementId>) {
            for &child in tree.children(id) {
                match tree.get(child).kind() {
                    ElementKind::ClockLine => out.push(child),
                    ElementKind::Headline => {}
                    _ => collect(tree, child, out),
                }
            }
        }
        let mut out = Vec::new();
        collect(tree, headline, &mut out);
        out
    }

    fn child_headlines(tree: &OrgTree, id: ElementId) -> impl Iterator<Item = ElementId> + '_ {
        tree.children(id)
            .iter()
            .copied()
            .filter(|&child| tree.get(child).kind() == ElementKind::Headline)
    }

    /// Own clock entries plus the totals of all nested headlines.
    /// One open or unreadable entry makes the result `Undefined`.
    pub fn clock_duration(tree: &OrgTree, headline: ElementId) -> IntervalDuration {
        let own: IntervalDuration = clock_entries(tree, headline)
            .into_iter()
            .filter_map(|id| tree.get(id).as_clock())
            .map(ClockLine::duration)
            .sum();
        own + child_headlines(tree, headline)
            .map(|child| clock_duration(tree, child))
            .sum::<IntervalDuration>()
    }

    /// Like [`clock_duration`], counting only the part of each entry inside `window`.
    /// There is no upstream reference result for this sum; the tests below are its only check.
    pub fn clock_duration_within(
        tree: &OrgTree,
        headline: ElementId,
        window: &TimeInterval,
    ) -> IntervalDuration {
        let own: IntervalDuration = clock_entries(tree, headline)
            .into_iter()
            .filter_map(|id| tree.get(id).as_clock())
            .map(|clock| clock.interval().intersection(window).duration())
            .sum();
        own + child_headlines(tree, headline)
            .map(|child| clock_duration_within(tree, child, window))
            .sum::<IntervalDuration>()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_str;
        use chrono::NaiveDate;
        use regex::Regex;

        fn headline(tree: &OrgTree, pattern: &str) -> ElementId {
            tree.find_element(tree.root(), ElementKind::Headline, &Regex::new(pattern).unwrap())
                .unwrap_or_else(|| panic!("no headline matching {pattern}"))
        }

        const CLOCK_ENTRIES: &str = r#"* headline_1
** headline_1_1
CLOCK: [2015-03-26 Thu 10:00]--[2015-03-26 Thu 10:10] =>  0:10
** headline_1_2
CLOCK: [2015-03-26 Thu 11:00]--[2015-03-26 Thu 11:05] =>  0:05
CLOCK: [2015-03-26 Thu 12:00]--[2015-03-26 Thu 12:15] =>  0:15
"#;

        #[test]
        fn durations_aggregate_up_the_tree() {
            let tree = parse_str(CLOCK_ENTRIES, "ClockEntries.org");
            let h11 = headline(&tree, "headline_1_1");
            let h12 = headline(&tree, "headline_1_2");
            let h1 = headline(&tree, "headline_1");
            assert_eq!(clock_duration(&tree, h11), IntervalDuration::Seconds(10 * 60));
            assert_eq!(clock_duration(&tree, h12), IntervalDuration::Seconds(20 * 60));
            assert_eq!(clock_duration(&tree, h1), IntervalDuration::Seconds(1800));
            assert_eq!(clock_duration(&tree, tree.root()), IntervalDuration::Seconds(1800));
            assert!(clock_entries(&tree, h1).is_empty());
        }

        #[test]
        fn logbook_entries_belong_to_their_headline() {
            let input = r#"#+DRAWERS: LOGBOOK
* Task
:LOGBOOK:
CLOCK: [2024-01-10 Wed 09:00]--[2024-01-10 Wed 10:30] =>  1:30
:END:
** Sub
CLOCK: [2024-01-10 Wed 11:00]--[2024-01-10 Wed 11:30] =>  0:30
"#;
            let tree = parse_str(input, "logbook.org");
            let task = headline(&tree, "Task");
            assert_eq!(clock_entries(&tree, task).len(), 1);
            assert_eq!(clock_duration(&tree, task), IntervalDuration::Seconds(7200));
        }

        #[test]
        fn open_clocks_make_totals_undefined() {
            let input = r#"* Parent
** Done
CLOCK: [2024-01-10 Wed 09:00]--[2024-01-10 Wed 09:30] =>  0:30
** Running
CLOCK: [2024-01-10 Wed 10:00]
* Broken
CLOCK: sometime
"#;
            let tree = parse_str(input, "open.org");
            assert_eq!(
                clock_duration(&tree, headline(&tree, "Done")),
                IntervalDuration::Seconds(1800)
            );
            assert_eq!(
                clock_duration(&tree, headline(&tree, "Parent")),
                IntervalDuration::Undefined
            );
            assert_eq!(
                clock_duration(&tree, headline(&tree, "Broken")),
                IntervalDuration::Undefined
            );
        }

        #[test]
        fn windowed_duration_counts_the_overlap_only() {
            let input = r#"* headline_1_1
CLOCK: [2015-03-26 Thu 10:00]--[2015-03-26 Thu 11:00] =>  1:00
CLOCK: [2015-03-26 Thu 23:30]--[2015-03-27 Fri 00:30] =>  1:00
CLOCK: [2015-03-27 Fri 09:00]--[2015-03-27 Fri 09:30] =>  0:30
"#;
            let tree = parse_str(input, "WeirdClockEntries.org");
            let h = headline(&tree, "headline_1_1");
            let mar26 = NaiveDate::from_ymd_opt(2015, 3, 26).unwrap();
            let mar27 = NaiveDate::from_ymd_opt(2015, 3, 27).unwrap();
            assert_eq!(clock_duration(&tree, h), IntervalDuration::Seconds(150 * 60));
            assert_eq!(
                clock_duration_within(&tree, h, &TimeInterval::day(mar26)),
                IntervalDuration::Seconds(90 * 60)
            );
            assert_eq!(
                clock_duration_within(&tree, h, &TimeInterval::day(mar27)),
                IntervalDuration::Seconds(60 * 60)
            );
            let march_28 = TimeInterval::day(NaiveDate::from_ymd_opt(2015, 3, 28).unwrap());
            assert_eq!(clock_duration_within(&tree, h, &march_28), IntervalDuration::ZERO);
        }

        #[test]
        fn windowed_duration_bounds_open_clocks() {
            let tree = parse_str("* Running\nCLOCK: [2015-03-27 Fri 20:00]\n", "running.org");
            let h = headline(&tree, "Running");
            let mar27 = NaiveDate::from_ymd_opt(2015, 3, 27).unwrap();
            assert_eq!(clock_duration(&tree, h), IntervalDuration::Undefined);
            assert_eq!(
                clock_duration_within(&tree, h, &TimeInterval::day(mar27)),
                IntervalDuration::Seconds(4 * 3600)
            );
        }
    }
}

pub use attributes::{file_attribute, file_attributes, has_tag, property, tags};
pub use clock::{clock_duration, clock_duration_within};
pub use crate::core::{ElementId, ElementKind, OrgTree};
pub use error::{OrgError, Result};
pub use format::{write, write_string};
pub use interval::{IntervalDuration, TimeInterval};
pub use parser::{NomOrgParser, parse, parse_str};
