use serde::{
    Deserialize,
    Serialize,
};

use crate::entity::{
    ETag,
    Entity,
};

/// How a pending action is applied to the stored row with the same identity.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[strum(ascii_case_insensitive)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum OperationKind {
    /// Insert. Fails if the row exists.
    Add,
    Delete,
    /// Merge into an existing row. Fails if the row is missing.
    UpdateMerge,
    /// Replace an existing row. Fails if the row is missing.
    UpdateReplace,
    UpsertMerge,
    UpsertReplace,
}

impl OperationKind {
    /// Kinds accepted when adding entities.
    pub const ADD_KINDS: &'static [OperationKind] = &[
        OperationKind::Add,
        OperationKind::UpsertMerge,
        OperationKind::UpsertReplace,
    ];
    /// Kinds accepted when updating entities.
    pub const UPDATE_KINDS: &'static [OperationKind] = &[
        OperationKind::UpdateMerge,
        OperationKind::UpdateReplace,
        OperationKind::UpsertMerge,
        OperationKind::UpsertReplace,
    ];

    /// Whether the kind can be made conditional on the stored row's version.
    pub fn supports_if_match(&self) -> bool {
        matches!(
            self,
            OperationKind::Delete | OperationKind::UpdateMerge | OperationKind::UpdateReplace
        )
    }
}

/// One entity write or delete waiting to be submitted.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionAction {
    pub kind: OperationKind,
    pub entity: Entity,
    /// When set, the backend must reject the action unless the stored row
    /// carries this version.
    pub if_match: Option<ETag>,
}

impl TransactionAction {
    pub fn new(kind: OperationKind, entity: Entity) -> Self {
        Self {
            kind,
            entity,
            if_match: None,
        }
    }

    /// Makes the action conditional on the entity's own version tag, if it
    /// has one and the kind supports it.
    pub fn conditional(kind: OperationKind, entity: Entity) -> Self {
        let if_match = if kind.supports_if_match() {
            entity.etag().cloned()
        } else {
            None
        };
        Self {
            kind,
            entity,
            if_match,
        }
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.entity.partition_key()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_kinds_parse_case_insensitively() -> anyhow::Result<()> {
        assert_eq!(
            OperationKind::from_str("upsertreplace")?,
            OperationKind::UpsertReplace
        );
        assert_eq!(OperationKind::from_str("ADD")?, OperationKind::Add);
        assert!(OperationKind::from_str("Insert").is_err());
        Ok(())
    }

    #[test]
    fn test_conditional_actions_only_for_versioned_kinds() {
        let entity = Entity::new("P1", "1").with_etag(ETag::new("W/\"1\""));
        let delete = TransactionAction::conditional(OperationKind::Delete, entity.clone());
        assert_eq!(delete.if_match, Some(ETag::new("W/\"1\"")));
        let upsert = TransactionAction::conditional(OperationKind::UpsertMerge, entity);
        assert_eq!(upsert.if_match, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn test_display_parses_back(kind in any::<OperationKind>()) {
            prop_assert_eq!(OperationKind::from_str(&kind.to_string()).ok(), Some(kind));
            prop_assert_eq!(
                OperationKind::from_str(&kind.to_string().to_lowercase()).ok(),
                Some(kind)
            );
        }
    }
}
