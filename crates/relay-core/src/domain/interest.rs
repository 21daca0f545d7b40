//! Object/attribute interest sets and the status cache.
//!
//! A client expresses interest as a map from object name to the attributes it
//! wants, for example:
//!
//! ```json
//! {"toolhead": ["position", "homed_axes"], "print_stats": null}
//! ```
//!
//! [`AttributeSet`] models one entry of that map: either every attribute of
//! the object ([`AttributeSet::All`]) or a named subset.  `All` dominates any
//! subset when interests are merged.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use thiserror::Error;

/// Wildcard accepted in a subscribe request to mean "every attribute".
pub const ALL_ATTRIBUTES: &str = "*";

/// Interest per object name.
pub type InterestMap = BTreeMap<String, AttributeSet>;

/// Requested change per object in a subscribe call: `None` cancels interest.
pub type InterestChanges = BTreeMap<String, Option<AttributeSet>>;

/// Errors produced while parsing an `objects` request payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterestError {
    /// The `objects` value was not a JSON object.
    #[error("'objects' must be a JSON object mapping names to attribute lists")]
    NotAnObject,

    /// An attribute list contained something other than strings.
    #[error("invalid attribute list for object '{object}'")]
    InvalidAttributes { object: String },
}

/// The attributes of one object a party is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeSet {
    /// Every attribute the object exposes.
    All,
    /// Only the named attributes.
    Only(BTreeSet<String>),
}

impl AttributeSet {
    /// Convenience constructor for a named subset.
    pub fn only<I, S>(attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributeSet::Only(attrs.into_iter().map(Into::into).collect())
    }

    /// `true` for a named subset with no names in it.
    pub fn is_empty(&self) -> bool {
        matches!(self, AttributeSet::Only(set) if set.is_empty())
    }

    /// Whether `attr` is part of this set.
    pub fn contains(&self, attr: &str) -> bool {
        match self {
            AttributeSet::All => true,
            AttributeSet::Only(set) => set.contains(attr),
        }
    }

    /// Unions `other` into `self`.  `All` absorbs everything.
    pub fn merge(&mut self, other: &AttributeSet) {
        match (&mut *self, other) {
            (AttributeSet::All, _) => {}
            (_, AttributeSet::All) => *self = AttributeSet::All,
            (AttributeSet::Only(mine), AttributeSet::Only(theirs)) => {
                mine.extend(theirs.iter().cloned());
            }
        }
    }

    /// Whether every attribute in `other` is also in `self`.
    pub fn covers(&self, other: &AttributeSet) -> bool {
        match (self, other) {
            (AttributeSet::All, _) => true,
            (AttributeSet::Only(_), AttributeSet::All) => false,
            (AttributeSet::Only(mine), AttributeSet::Only(theirs)) => theirs.is_subset(mine),
        }
    }

    /// Returns the subset of `fields` named by this set.
    pub fn filter(&self, fields: &Map<String, Value>) -> Map<String, Value> {
        match self {
            AttributeSet::All => fields.clone(),
            AttributeSet::Only(set) => fields
                .iter()
                .filter(|(k, _)| set.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Upstream representation: `null` for all attributes, else a name list.
    pub fn to_wire(&self) -> Value {
        match self {
            AttributeSet::All => Value::Null,
            AttributeSet::Only(set) => {
                Value::Array(set.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

/// Whether `outer` includes every object/attribute requested in `inner`.
pub fn interest_covers(outer: &InterestMap, inner: &InterestMap) -> bool {
    inner.iter().all(|(object, wanted)| {
        outer
            .get(object)
            .map(|have| have.covers(wanted))
            .unwrap_or(false)
    })
}

/// Serialises an interest map in the upstream `objects` shape.
pub fn interest_to_wire(interest: &InterestMap) -> Value {
    Value::Object(
        interest
            .iter()
            .map(|(name, set)| (name.clone(), set.to_wire()))
            .collect(),
    )
}

// ── Request parsing ───────────────────────────────────────────────────────────

/// Parses the `objects` payload of a subscribe call.
///
/// `null` or an empty list cancels the caller's interest in that object; a
/// list of names selects those attributes; `"*"` (alone or inside the list)
/// selects all attributes.
///
/// # Errors
///
/// Returns [`InterestError`] for a non-object payload or non-string names.
pub fn parse_subscription_request(objects: &Value) -> Result<InterestChanges, InterestError> {
    let map = objects.as_object().ok_or(InterestError::NotAnObject)?;
    let mut changes = InterestChanges::new();
    for (name, attrs) in map {
        let set = match attrs {
            Value::Null => None,
            other => {
                let set = parse_attribute_value(name, other)?;
                (!set.is_empty()).then_some(set)
            }
        };
        changes.insert(name.clone(), set);
    }
    Ok(changes)
}

/// Parses the `objects` payload of a one-shot query.
///
/// Here `null` means "all known attributes".
///
/// # Errors
///
/// Returns [`InterestError`] for a non-object payload or non-string names.
pub fn parse_query_request(objects: &Value) -> Result<InterestMap, InterestError> {
    let map = objects.as_object().ok_or(InterestError::NotAnObject)?;
    map.iter()
        .map(|(name, attrs)| {
            let set = match attrs {
                Value::Null => AttributeSet::All,
                other => parse_attribute_value(name, other)?,
            };
            Ok((name.clone(), set))
        })
        .collect()
}

fn parse_attribute_value(object: &str, value: &Value) -> Result<AttributeSet, InterestError> {
    let invalid = || InterestError::InvalidAttributes {
        object: object.to_string(),
    };
    match value {
        Value::String(s) if s == ALL_ATTRIBUTES => Ok(AttributeSet::All),
        Value::Array(items) => {
            let mut names = BTreeSet::new();
            for item in items {
                let name = item.as_str().ok_or_else(invalid)?;
                if name == ALL_ATTRIBUTES {
                    return Ok(AttributeSet::All);
                }
                names.insert(name.to_string());
            }
            Ok(AttributeSet::Only(names))
        }
        _ => Err(invalid()),
    }
}

// ── Status cache ──────────────────────────────────────────────────────────────

/// Latest known attribute values per object.
#[derive(Debug, Clone, Default)]
pub struct ObjectCache {
    objects: BTreeMap<String, Map<String, Value>>,
    eventtime: f64,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a push: every attribute in `status` overwrites the cache.
    pub fn merge(&mut self, status: &Map<String, Value>, eventtime: f64) {
        for (name, fields) in status {
            if let Some(fields) = fields.as_object() {
                self.objects
                    .entry(name.clone())
                    .or_default()
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        if eventtime > self.eventtime {
            self.eventtime = eventtime;
        }
    }

    /// Applies the result of an upstream subscribe call.
    ///
    /// The result may be older than pushes that are already applied or still
    /// queued, but only for attributes that were subscribed before the call.
    /// Attributes covered by `previous` therefore keep their cached value;
    /// attributes that are newly covered are taken from the result.
    pub fn absorb_subscription(
        &mut self,
        status: &Map<String, Value>,
        eventtime: f64,
        previous: &InterestMap,
    ) {
        for (name, fields) in status {
            let Some(fields) = fields.as_object() else {
                continue;
            };
            let before = previous.get(name);
            let entry = self.objects.entry(name.clone()).or_default();
            for (k, v) in fields {
                let was_covered = before.map(|set| set.contains(k)).unwrap_or(false);
                if was_covered {
                    entry.entry(k.clone()).or_insert_with(|| v.clone());
                } else {
                    entry.insert(k.clone(), v.clone());
                }
            }
        }
        if eventtime > self.eventtime {
            self.eventtime = eventtime;
        }
    }

    /// Filtered view of the cache for `request`.  Objects never seen are
    /// omitted.
    pub fn snapshot(&self, request: &InterestMap) -> Map<String, Value> {
        request
            .iter()
            .filter_map(|(name, set)| {
                self.objects
                    .get(name)
                    .map(|fields| (name.clone(), Value::Object(set.filter(fields))))
            })
            .collect()
    }

    pub fn contains(&self, object: &str) -> bool {
        self.objects.contains_key(object)
    }

    /// Event time of the newest data merged so far.
    pub fn eventtime(&self) -> f64 {
        self.eventtime
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.eventtime = 0.0;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_all_dominates_subset() {
        let mut set = AttributeSet::only(["position"]);
        set.merge(&AttributeSet::All);
        assert_eq!(set, AttributeSet::All);

        let mut all = AttributeSet::All;
        all.merge(&AttributeSet::only(["x"]));
        assert_eq!(all, AttributeSet::All);
    }

    #[test]
    fn test_merge_unions_subsets() {
        let mut set = AttributeSet::only(["position"]);
        set.merge(&AttributeSet::only(["homed_axes", "position"]));
        assert_eq!(set, AttributeSet::only(["homed_axes", "position"]));
    }

    #[test]
    fn test_covers() {
        let set = AttributeSet::only(["a", "b"]);
        assert!(set.covers(&AttributeSet::only(["a"])));
        assert!(!set.covers(&AttributeSet::only(["c"])));
        assert!(!set.covers(&AttributeSet::All));
        assert!(AttributeSet::All.covers(&set));
    }

    #[test]
    fn test_filter_returns_only_requested_fields() {
        let fields = json!({"position": [0, 0, 0, 0], "homed_axes": "xyz", "max_velocity": 300});
        let filtered = AttributeSet::only(["position"]).filter(fields.as_object().unwrap());
        assert_eq!(Value::Object(filtered), json!({"position": [0, 0, 0, 0]}));
    }

    #[test]
    fn test_parse_subscription_null_and_empty_cancel() {
        let changes =
            parse_subscription_request(&json!({"toolhead": null, "fan": [], "extruder": ["temperature"]}))
                .unwrap();
        assert_eq!(changes["toolhead"], None);
        assert_eq!(changes["fan"], None);
        assert_eq!(
            changes["extruder"],
            Some(AttributeSet::only(["temperature"]))
        );
    }

    #[test]
    fn test_parse_subscription_wildcard_selects_all() {
        let changes =
            parse_subscription_request(&json!({"toolhead": "*", "fan": ["speed", "*"]})).unwrap();
        assert_eq!(changes["toolhead"], Some(AttributeSet::All));
        assert_eq!(changes["fan"], Some(AttributeSet::All));
    }

    #[test]
    fn test_parse_query_null_means_all() {
        let request = parse_query_request(&json!({"print_stats": null})).unwrap();
        assert_eq!(request["print_stats"], AttributeSet::All);
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        assert_eq!(
            parse_query_request(&json!(["toolhead"])),
            Err(InterestError::NotAnObject)
        );
        assert_eq!(
            parse_subscription_request(&json!({"toolhead": [1, 2]})),
            Err(InterestError::InvalidAttributes {
                object: "toolhead".into()
            })
        );
    }

    #[test]
    fn test_interest_covers() {
        let mut outer = InterestMap::new();
        outer.insert("toolhead".into(), AttributeSet::only(["position", "homed_axes"]));
        let mut inner = InterestMap::new();
        inner.insert("toolhead".into(), AttributeSet::only(["position"]));
        assert!(interest_covers(&outer, &inner));

        inner.insert("fan".into(), AttributeSet::All);
        assert!(!interest_covers(&outer, &inner));
    }

    #[test]
    fn test_interest_to_wire() {
        let mut interest = InterestMap::new();
        interest.insert("print_stats".into(), AttributeSet::All);
        interest.insert("toolhead".into(), AttributeSet::only(["position"]));
        assert_eq!(
            interest_to_wire(&interest),
            json!({"print_stats": null, "toolhead": ["position"]})
        );
    }

    #[test]
    fn test_cache_merge_then_snapshot() {
        let mut cache = ObjectCache::new();
        cache.merge(
            json!({"toolhead": {"position": [1, 2, 3, 0], "homed_axes": "xy"}})
                .as_object()
                .unwrap(),
            10.0,
        );
        cache.merge(json!({"toolhead": {"homed_axes": "xyz"}}).as_object().unwrap(), 11.0);

        let mut request = InterestMap::new();
        request.insert("toolhead".into(), AttributeSet::only(["homed_axes"]));
        request.insert("fan".into(), AttributeSet::All);

        let snap = cache.snapshot(&request);
        assert_eq!(Value::Object(snap), json!({"toolhead": {"homed_axes": "xyz"}}));
        assert_eq!(cache.eventtime(), 11.0);
    }

    #[test]
    fn test_absorb_subscription_keeps_previously_covered_values() {
        // Arrange: speed was already subscribed and has a newer pushed value
        let mut cache = ObjectCache::new();
        cache.merge(json!({"fan": {"speed": 0.5, "rpm": 900}}).as_object().unwrap(), 5.0);
        let mut previous = InterestMap::new();
        previous.insert("fan".into(), AttributeSet::only(["speed"]));

        // Act: the subscribe result now also covers rpm
        cache.absorb_subscription(
            json!({"fan": {"speed": 0.1, "rpm": 1200}}).as_object().unwrap(),
            4.0,
            &previous,
        );

        // Assert: speed kept, stale rpm replaced
        let mut request = InterestMap::new();
        request.insert("fan".into(), AttributeSet::All);
        assert_eq!(
            Value::Object(cache.snapshot(&request)),
            json!({"fan": {"speed": 0.5, "rpm": 1200}})
        );
        assert_eq!(cache.eventtime(), 5.0);
    }
}
