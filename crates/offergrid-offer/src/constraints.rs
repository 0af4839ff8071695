//! Matching a version's placement constraints against a candidate host.
//!
//! Every constraint group must pass; inside a group one passing item is
//! enough. Counting operators (`UNIQUE`, `MAXPER`) look at where the
//! application's live taskgroups already run, summarized in a
//! [`PlacedSet`].

use std::collections::HashMap;

use regex::Regex;

use offergrid_state::{
    Attribute, ConstValueType, ConstraintData, ConstraintOperator, Constraints,
};

use crate::error::{OfferError, OfferResult};
use crate::pool::Offer;

/// Attribute name resolving to the agent hostname.
pub const HOSTNAME_ATTR: &str = "hostname";
/// Attribute name resolving to the agent address.
pub const INNER_IP_ATTR: &str = "InnerIP";

/// A host as seen by constraint evaluation.
#[derive(Debug, Clone)]
pub struct HostView {
    pub hostname: String,
    pub ip: String,
    pub attributes: HashMap<String, Attribute>,
}

impl HostView {
    pub fn from_offer(offer: &Offer) -> Self {
        Self {
            hostname: offer.hostname.clone(),
            ip: offer.ip.clone(),
            attributes: offer.attributes.clone(),
        }
    }

    /// Overlay plugin-provided attributes; plugin values win.
    pub fn merge(&mut self, extra: HashMap<String, Attribute>) {
        self.attributes.extend(extra);
    }

    pub fn attribute(&self, name: &str) -> Option<Attribute> {
        match name {
            HOSTNAME_ATTR => Some(Attribute::Text(self.hostname.clone())),
            INNER_IP_ATTR => Some(Attribute::Text(self.ip.clone())),
            _ => self.attributes.get(name).cloned(),
        }
    }

    fn text(&self, name: &str) -> Option<String> {
        self.attribute(name).and_then(|a| a.as_text())
    }
}

/// Count of an application's live taskgroups per attribute value.
#[derive(Debug, Default, Clone)]
pub struct PlacedSet {
    counts: HashMap<String, HashMap<String, u32>>,
}

impl PlacedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one taskgroup running on `host`.
    pub fn record(&mut self, host: &HostView) {
        let mut names: Vec<&str> = vec![HOSTNAME_ATTR, INNER_IP_ATTR];
        names.extend(host.attributes.keys().map(String::as_str));
        for name in names {
            if let Some(value) = host.text(name) {
                *self
                    .counts
                    .entry(name.to_string())
                    .or_default()
                    .entry(value)
                    .or_insert(0) += 1;
            }
        }
    }

    pub fn count(&self, name: &str, value: &str) -> u32 {
        self.counts
            .get(name)
            .and_then(|m| m.get(value))
            .copied()
            .unwrap_or(0)
    }
}

/// Whether `host` satisfies `constraints` given the existing placements.
pub fn host_satisfies(
    constraints: Option<&Constraints>,
    host: &HostView,
    placed: &PlacedSet,
) -> OfferResult<bool> {
    let Some(constraints) = constraints else {
        return Ok(true);
    };
    for group in &constraints.intersection {
        if group.union.is_empty() {
            continue;
        }
        let mut any = false;
        for item in &group.union {
            if item_satisfied(item, host, placed)? {
                any = true;
                break;
            }
        }
        if !any {
            return Ok(false);
        }
    }
    Ok(true)
}

fn item_satisfied(item: &ConstraintData, host: &HostView, placed: &PlacedSet) -> OfferResult<bool> {
    let value = host.text(&item.name);
    let ok = match item.operator {
        ConstraintOperator::Unique => match &value {
            Some(v) => placed.count(&item.name, v) == 0,
            None => false,
        },
        ConstraintOperator::MaxPer => {
            let limit = match item.value_type {
                ConstValueType::Scalar => item.scalar.map(|s| s as u32),
                _ => item.text.as_deref().and_then(|t| t.parse().ok()),
            }
            .unwrap_or(1);
            match &value {
                Some(v) => placed.count(&item.name, v) < limit,
                None => false,
            }
        }
        ConstraintOperator::Cluster => match (&value, item.value_type) {
            (Some(v), ConstValueType::Set) => item.set.iter().flatten().any(|s| s == v),
            (Some(v), _) => item.text.as_deref() == Some(v.as_str()),
            (None, _) => false,
        },
        ConstraintOperator::Like => match &value {
            Some(v) => pattern(item)?.is_match(v),
            None => false,
        },
        ConstraintOperator::Unlike => match &value {
            Some(v) => !pattern(item)?.is_match(v),
            None => true,
        },
        ConstraintOperator::Greater => {
            let threshold = item.scalar.unwrap_or(0.0);
            match host.attribute(&item.name) {
                Some(Attribute::Scalar(v)) => v > threshold,
                Some(Attribute::Text(t)) => t.parse::<f64>().is_ok_and(|v| v > threshold),
                _ => false,
            }
        }
    };
    Ok(ok)
}

/// Compile the item's text as a whole-value regular expression.
fn pattern(item: &ConstraintData) -> OfferResult<Regex> {
    let raw = item.text.as_deref().unwrap_or_default();
    Regex::new(&format!("^(?:{raw})$")).map_err(|e| OfferError::InvalidPattern {
        name: item.name.clone(),
        pattern: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use offergrid_state::ConstraintGroup;

    fn host(name: &str, rack: &str) -> HostView {
        let mut attributes = HashMap::new();
        attributes.insert("rack".to_string(), Attribute::Text(rack.to_string()));
        attributes.insert("cores".to_string(), Attribute::Scalar(16.0));
        HostView {
            hostname: name.to_string(),
            ip: format!("10.0.0.{}", name.len()),
            attributes,
        }
    }

    fn item(name: &str, operator: ConstraintOperator, value_type: ConstValueType) -> ConstraintData {
        ConstraintData {
            name: name.to_string(),
            operator,
            value_type,
            scalar: None,
            text: None,
            set: None,
            ranges: None,
        }
    }

    fn all_of(groups: Vec<Vec<ConstraintData>>) -> Constraints {
        Constraints {
            intersection: groups.into_iter().map(|union| ConstraintGroup { union }).collect(),
        }
    }

    #[test]
    fn unique_hostname_spreads() {
        let c = all_of(vec![vec![item(HOSTNAME_ATTR, ConstraintOperator::Unique, ConstValueType::Text)]]);
        let mut placed = PlacedSet::new();
        assert!(host_satisfies(Some(&c), &host("a", "r1"), &placed).unwrap());
        placed.record(&host("a", "r1"));
        assert!(!host_satisfies(Some(&c), &host("a", "r1"), &placed).unwrap());
        assert!(host_satisfies(Some(&c), &host("b", "r1"), &placed).unwrap());
    }

    #[test]
    fn max_per_rack() {
        let mut per_rack = item("rack", ConstraintOperator::MaxPer, ConstValueType::Scalar);
        per_rack.scalar = Some(2.0);
        let c = all_of(vec![vec![per_rack]]);
        let mut placed = PlacedSet::new();
        placed.record(&host("a", "r1"));
        assert!(host_satisfies(Some(&c), &host("b", "r1"), &placed).unwrap());
        placed.record(&host("b", "r1"));
        assert!(!host_satisfies(Some(&c), &host("c", "r1"), &placed).unwrap());
        assert!(host_satisfies(Some(&c), &host("c", "r2"), &placed).unwrap());
    }

    #[test]
    fn union_inside_group_intersection_across() {
        let mut r1 = item("rack", ConstraintOperator::Cluster, ConstValueType::Text);
        r1.text = Some("r1".into());
        let mut r2 = item("rack", ConstraintOperator::Cluster, ConstValueType::Text);
        r2.text = Some("r2".into());
        let mut not_b = item(HOSTNAME_ATTR, ConstraintOperator::Unlike, ConstValueType::Text);
        not_b.text = Some("b.*".into());
        let c = all_of(vec![vec![r1, r2], vec![not_b]]);

        let placed = PlacedSet::new();
        assert!(host_satisfies(Some(&c), &host("a", "r2"), &placed).unwrap());
        assert!(!host_satisfies(Some(&c), &host("a", "r3"), &placed).unwrap());
        assert!(!host_satisfies(Some(&c), &host("box", "r1"), &placed).unwrap());
    }

    #[test]
    fn like_set_and_greater() {
        let placed = PlacedSet::new();
        let mut like = item(HOSTNAME_ATTR, ConstraintOperator::Like, ConstValueType::Text);
        like.text = Some("node-[0-9]+".into());
        let c = all_of(vec![vec![like]]);
        assert!(host_satisfies(Some(&c), &host("node-12", "r"), &placed).unwrap());
        assert!(!host_satisfies(Some(&c), &host("xnode-12", "r"), &placed).unwrap());

        let mut set = item("rack", ConstraintOperator::Cluster, ConstValueType::Set);
        set.set = Some(vec!["r1".into(), "r9".into()]);
        let c = all_of(vec![vec![set]]);
        assert!(host_satisfies(Some(&c), &host("a", "r9"), &placed).unwrap());

        let mut greater = item("cores", ConstraintOperator::Greater, ConstValueType::Scalar);
        greater.scalar = Some(8.0);
        let c = all_of(vec![vec![greater.clone()]]);
        assert!(host_satisfies(Some(&c), &host("a", "r"), &placed).unwrap());
        greater.scalar = Some(32.0);
        let c = all_of(vec![vec![greater]]);
        assert!(!host_satisfies(Some(&c), &host("a", "r"), &placed).unwrap());
    }

    #[test]
    fn bad_pattern_is_an_error() {
        let mut like = item(HOSTNAME_ATTR, ConstraintOperator::Like, ConstValueType::Text);
        like.text = Some("(".into());
        let c = all_of(vec![vec![like]]);
        assert!(host_satisfies(Some(&c), &host("a", "r"), &PlacedSet::new()).is_err());
    }

    #[test]
    fn plugin_attributes_override() {
        let mut h = host("a", "r1");
        let mut extra = HashMap::new();
        extra.insert("rack".to_string(), Attribute::Text("r7".into()));
        h.merge(extra);
        assert_eq!(h.attribute("rack"), Some(Attribute::Text("r7".into())));
    }
}
