use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::contract::{
    AccessControlEntry, Action, ContractError, DataClass, EntityKind, ServiceContract,
};

/// Default hop bound for `network` entries that do not declare one
pub const DEFAULT_DISTANCE: u32 = 1;

/// What the table says about one (entity, action) pair
#[derive(Debug, Clone, Default)]
pub struct Permission {
    pub allowed: bool,
    pub cache_ttl: Option<Duration>,
    pub distance_bound: Option<u32>,
    pub relation: Option<Regex>,
}

impl Permission {
    pub const DENY: Permission = Permission {
        allowed: false,
        cache_ttl: None,
        distance_bound: None,
        relation: None,
    };
}

#[derive(Debug, Clone)]
struct CompiledEntry {
    actions: BTreeSet<Action>,
    cache_ttl: Option<Duration>,
    distance: Option<u32>,
    relation: Option<Regex>,
}

/// Compiled access rules for one data class
///
/// Each entity kind has at most one entry. `network` specifiers are kept as data; they
/// can only be evaluated against the live graph at request time.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    name: String,
    class: DataClass,
    entries: BTreeMap<EntityKind, CompiledEntry>,
}

impl PolicyTable {
    pub fn compile(name: &str, class: &DataClass) -> Result<Self, ContractError> {
        let mut entries = BTreeMap::new();
        for entry in &class.acl {
            let (kind, compiled) = compile_entry(name, entry)?;
            if entries.insert(kind, compiled).is_some() {
                return Err(ContractError::DuplicateEntry {
                    class: name.to_string(),
                    entity: kind,
                });
            }
        }
        Ok(Self {
            name: name.to_string(),
            class: class.clone(),
            entries,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &DataClass {
        &self.class
    }

    pub fn has_entry(&self, kind: EntityKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Look up the permission for an (entity, action) pair. Missing means denied.
    pub fn permission(&self, kind: EntityKind, action: Action) -> Permission {
        let Some(entry) = self.entries.get(&kind) else {
            return Permission::DENY;
        };
        Permission {
            allowed: entry.actions.contains(&action),
            cache_ttl: entry.cache_ttl,
            distance_bound: entry.distance,
            relation: entry.relation.clone(),
        }
    }
}

fn compile_entry(
    class: &str,
    entry: &AccessControlEntry,
) -> Result<(EntityKind, CompiledEntry), ContractError> {
    let kind: EntityKind = entry
        .entity
        .parse()
        .map_err(|_| ContractError::UnknownEntity {
            class: class.to_string(),
            entity: entry.entity.clone(),
        })?;

    let mut actions = BTreeSet::new();
    for action in &entry.actions {
        actions.insert(
            action
                .parse::<Action>()
                .map_err(|_| ContractError::UnknownAction {
                    class: class.to_string(),
                    action: action.clone(),
                })?,
        );
    }

    let misplaced = |specifier: &'static str| ContractError::MisplacedSpecifier {
        class: class.to_string(),
        entity: kind,
        specifier,
    };

    let (distance, relation) = if kind == EntityKind::Network {
        let declared = entry.distance.unwrap_or(DEFAULT_DISTANCE as i64);
        let distance = u32::try_from(declared)
            .ok()
            .filter(|d| *d >= 1)
            .ok_or(ContractError::InvalidDistance {
                class: class.to_string(),
                distance: declared,
            })?;
        let relation = entry
            .relation
            .as_deref()
            .map(|pattern| {
                Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
                    ContractError::InvalidRelation {
                        class: class.to_string(),
                        pattern: pattern.to_string(),
                        source,
                    }
                })
            })
            .transpose()?;
        (Some(distance), relation)
    } else {
        if entry.distance.is_some() {
            return Err(misplaced("distance"));
        }
        if entry.relation.is_some() {
            return Err(misplaced("relation"));
        }
        (None, None)
    };

    Ok((
        kind,
        CompiledEntry {
            actions,
            cache_ttl: entry.cache.map(Duration::from_secs),
            distance,
            relation,
        },
    ))
}

/// Every class table of one contract version
#[derive(Debug)]
pub struct CompiledContract {
    service_id: String,
    version: u32,
    tables: BTreeMap<String, Arc<PolicyTable>>,
}

impl CompiledContract {
    pub fn compile(contract: &ServiceContract) -> Result<Self, ContractError> {
        let mut tables = BTreeMap::new();
        for (name, class) in &contract.classes {
            tables.insert(name.clone(), Arc::new(PolicyTable::compile(name, class)?));
        }
        Ok(Self {
            service_id: contract.service_id.clone(),
            version: contract.version,
            tables,
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn table(&self, class: &str) -> Option<Arc<PolicyTable>> {
        self.tables.get(class).cloned()
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<PolicyTable>> {
        self.tables.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ClassKind;

    fn class_with(entries: Vec<AccessControlEntry>) -> DataClass {
        let mut class = DataClass::new(ClassKind::Array);
        class.acl = entries;
        class
    }

    #[test]
    fn test_unlisted_pairs_are_denied() {
        let table = PolicyTable::compile(
            "assets",
            &class_with(vec![
                AccessControlEntry::new(EntityKind::Member, &[Action::Read, Action::Append]),
                AccessControlEntry::new(EntityKind::AnyMember, &[Action::Append]),
            ]),
        )
        .unwrap();

        for kind in EntityKind::ALL {
            for action in Action::ALL {
                let listed = matches!(
                    (kind, action),
                    (EntityKind::Member, Action::Read)
                        | (EntityKind::Member, Action::Append)
                        | (EntityKind::AnyMember, Action::Append)
                );
                assert_eq!(table.permission(kind, action).allowed, listed);
            }
        }
    }

    #[test]
    fn test_cache_ttl_is_carried() {
        let table = PolicyTable::compile(
            "assets",
            &class_with(vec![
                AccessControlEntry::new(EntityKind::Anonymous, &[Action::Read]).with_cache(30)
            ]),
        )
        .unwrap();
        let permission = table.permission(EntityKind::Anonymous, Action::Read);
        assert_eq!(permission.cache_ttl, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_network_defaults_to_distance_one() {
        let table = PolicyTable::compile(
            "assets",
            &class_with(vec![AccessControlEntry::new(
                EntityKind::Network,
                &[Action::Read],
            )]),
        )
        .unwrap();
        let permission = table.permission(EntityKind::Network, Action::Read);
        assert_eq!(permission.distance_bound, Some(1));
        assert!(permission.relation.is_none());
    }

    #[test]
    fn test_distance_below_one_fails() {
        for distance in [0, -3] {
            let result = PolicyTable::compile(
                "assets",
                &class_with(vec![AccessControlEntry::new(
                    EntityKind::Network,
                    &[Action::Read],
                )
                .with_distance(distance)]),
            );
            assert!(matches!(
                result,
                Err(ContractError::InvalidDistance { distance: d, .. }) if d == distance
            ));
        }
    }

    #[test]
    fn test_malformed_entries_fail() {
        let mut unknown_entity = AccessControlEntry::new(EntityKind::Member, &[Action::Read]);
        unknown_entity.entity = "owner".to_string();
        assert!(matches!(
            PolicyTable::compile("c", &class_with(vec![unknown_entity])),
            Err(ContractError::UnknownEntity { .. })
        ));

        let mut unknown_action = AccessControlEntry::new(EntityKind::Member, &[]);
        unknown_action.actions = vec!["write".to_string()];
        assert!(matches!(
            PolicyTable::compile("c", &class_with(vec![unknown_action])),
            Err(ContractError::UnknownAction { .. })
        ));

        let bad_regex =
            AccessControlEntry::new(EntityKind::Network, &[Action::Read]).with_relation("(friend");
        assert!(matches!(
            PolicyTable::compile("c", &class_with(vec![bad_regex])),
            Err(ContractError::InvalidRelation { .. })
        ));

        let misplaced =
            AccessControlEntry::new(EntityKind::AnyMember, &[Action::Read]).with_distance(2);
        assert!(matches!(
            PolicyTable::compile("c", &class_with(vec![misplaced])),
            Err(ContractError::MisplacedSpecifier {
                specifier: "distance",
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_entity_fails() {
        let result = PolicyTable::compile(
            "c",
            &class_with(vec![
                AccessControlEntry::new(EntityKind::Member, &[Action::Read]),
                AccessControlEntry::new(EntityKind::Member, &[Action::Update]),
            ]),
        );
        assert!(matches!(
            result,
            Err(ContractError::DuplicateEntry {
                entity: EntityKind::Member,
                ..
            })
        ));
    }

    #[test]
    fn test_relation_is_anchored() {
        let table = PolicyTable::compile(
            "c",
            &class_with(vec![AccessControlEntry::new(
                EntityKind::Network,
                &[Action::Read],
            )
            .with_relation("friend")]),
        )
        .unwrap();
        let relation = table
            .permission(EntityKind::Network, Action::Read)
            .relation
            .unwrap();
        assert!(relation.is_match("friend"));
        assert!(!relation.is_match("best friend"));
    }
}
