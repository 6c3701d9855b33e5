use std::collections::BTreeMap;

use errors::ErrorMetadataAnyhowExt;
use maplit::hashmap;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::{
    convert::{
        ConverterRegistry,
        ObjectEntityConverter,
    },
    entity::{
        Entity,
        EntityValue,
    },
    error::{
        OperationErrorCode,
        TableError,
        ValidationWarning,
    },
    operation::OperationKind,
    query::QueryOptions,
    record::{
        RawRecord,
        RawValue,
    },
    service::TableService,
    testing::{
        InMemoryTableStore,
        StaticCredentialProvider,
    },
};

const CONNECTION_STRING: &str =
    "DefaultEndpointsProtocol=https;AccountName=bobby;AccountKey=a2V5;EndpointSuffix=core.windows.net";
const TABLE: &str = "People";

async fn connect(store: &InMemoryTableStore) -> anyhow::Result<TableService> {
    Ok(TableService::create_with_connection_string(
        store,
        CONNECTION_STRING,
        Some(TABLE),
        true,
        CancellationToken::new(),
    )
    .await?)
}

fn person(partition_key: &str, row_key: &str) -> RawRecord {
    RawRecord::object([("PartitionKey", partition_key), ("RowKey", row_key)])
}

fn row_keys(entities: &[Entity]) -> Vec<String> {
    entities
        .iter()
        .filter_map(|e| e.row_key().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_single_add_is_one_transaction() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    let record = RawRecord::object([
        ("PartitionKey", "P1"),
        ("RowKey", "1"),
        ("Name", "Bobby"),
    ]);
    let summary = service.add_entities(&[record], OperationKind::Add).await?;
    assert_eq!((summary.actions, summary.transactions), (1, 1));
    assert!(summary.warnings.is_empty());

    let transactions = store.transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].kinds(), vec![OperationKind::Add]);
    assert_eq!(transactions[0].partition_key(), Some("P1"));
    assert!(transactions[0].committed);

    let stored = store.entity(TABLE, "P1", "1").unwrap();
    assert_eq!(stored.get("Name"), Some(&EntityValue::from("Bobby")));
    assert!(stored.etag().is_some());
    Ok(())
}

#[tokio::test]
async fn test_large_partition_is_chunked_in_order() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    let records: Vec<_> = (0..250).map(|i| person("P1", &format!("{i:03}"))).collect();
    let summary = service.add_entities(&records, OperationKind::Add).await?;
    assert_eq!((summary.actions, summary.transactions), (250, 3));

    let transactions = store.transactions();
    let sizes: Vec<_> = transactions.iter().map(|t| t.len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    let submitted: Vec<_> = transactions
        .iter()
        .flat_map(|t| t.actions.iter())
        .filter_map(|a| a.entity.row_key().map(str::to_string))
        .collect();
    let expected: Vec<_> = (0..250).map(|i| format!("{i:03}")).collect();
    assert_eq!(submitted, expected);
    Ok(())
}

#[tokio::test]
async fn test_one_transaction_per_partition() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    let partitions = ["A", "B", "A", "C", "B", "A", "C", "B", "C", "A"];
    let records: Vec<_> = partitions
        .iter()
        .enumerate()
        .map(|(i, pk)| person(pk, &i.to_string()))
        .collect();
    service
        .add_entities(&records, OperationKind::UpsertMerge)
        .await?;

    let transactions = store.transactions();
    let shape: Vec<_> = transactions
        .iter()
        .map(|t| (t.partition_key().unwrap().to_string(), t.len()))
        .collect();
    assert_eq!(
        shape,
        vec![
            ("A".to_string(), 4),
            ("B".to_string(), 3),
            ("C".to_string(), 3)
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_stale_etag_conflicts_unless_forced() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new().with_table(TABLE);
    store.insert(TABLE, Entity::new("P1", "1").with_field("Name", "Bobby"))?;
    let service = connect(&store).await?;

    let read = service
        .get_entities(&QueryOptions::new().filter("RowKey eq '1'"))
        .await?;
    assert_eq!(read.len(), 1);
    let stale = RawRecord::from(read[0].clone());

    // Someone else changes the row after it was read.
    service
        .update_entities(
            &[RawRecord::object([
                ("PartitionKey", "P1"),
                ("RowKey", "1"),
                ("Name", "Robert"),
            ])],
            OperationKind::UpdateMerge,
            false,
        )
        .await?;

    let err = service
        .update_entities(&[stale.clone()], OperationKind::UpdateReplace, true)
        .await
        .unwrap_err();
    assert!(err.is_concurrency_conflict());
    assert_eq!(err.code(), OperationErrorCode::UpdateEntitiesError);

    let err = service
        .remove_entities(&[stale.clone()], true)
        .await
        .unwrap_err();
    assert!(err.is_concurrency_conflict());
    assert_eq!(err.code(), OperationErrorCode::RemoveEntitiesError);
    assert!(store.entity(TABLE, "P1", "1").is_some());

    service.remove_entities(&[stale], false).await?;
    assert!(store.entity(TABLE, "P1", "1").is_none());
    Ok(())
}

#[tokio::test]
async fn test_current_etag_round_trips_through_update() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new().with_table(TABLE);
    store.insert(TABLE, Entity::new("P1", "1").with_field("Age", 41))?;
    let service = connect(&store).await?;

    let read = service.get_entities(&QueryOptions::new()).await?;
    let mut record = RawRecord::from(read[0].clone());
    let RawRecord::Object(props) = &mut record else {
        panic!("entities convert to object records");
    };
    props.push(crate::record::NamedProperty {
        name: "Name".to_string(),
        value: RawValue::from("Bobby"),
    });
    service
        .update_entities(&[record], OperationKind::UpdateMerge, true)
        .await?;

    let stored = store.entity(TABLE, "P1", "1").unwrap();
    assert_eq!(stored.get("Age"), Some(&EntityValue::Int32(41)));
    assert_eq!(stored.get("Name"), Some(&EntityValue::from("Bobby")));
    assert_ne!(stored.etag(), read[0].etag());
    Ok(())
}

#[tokio::test]
async fn test_sorted_query_is_stable() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new().with_table(TABLE);
    let names = [
        "Nilsson", "Berg", "Ek", "Berg", "Lind", "Ahl", "Ek", "Nilsson", "Ahl", "Strand", "Berg",
        "Ek", "Lind", "Ahl", "Holm", "Berg", "Ek", "Strand", "Holm", "Lind",
    ];
    for (i, name) in names.iter().enumerate() {
        store.insert(
            TABLE,
            Entity::new("P1", format!("{i:02}")).with_field("LastName", *name),
        )?;
    }
    let service = connect(&store).await?;

    let first = service
        .get_entities(&QueryOptions::new().sort_by(["LastName"]).top(5))
        .await?;
    assert_eq!(row_keys(&first), vec!["05", "08", "13", "01", "03"]);

    let page = service
        .get_entities(&QueryOptions::new().sort_by(["LastName"]).skip(3).top(2))
        .await?;
    assert_eq!(row_keys(&page), vec!["01", "03"]);
    Ok(())
}

#[tokio::test]
async fn test_unsorted_query_pages_lazily() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new().with_table(TABLE);
    for i in 0..10i32 {
        store.insert(TABLE, Entity::new("P1", i.to_string()).with_field("Age", i))?;
    }
    let service = connect(&store).await?;
    let entities = service
        .get_entities(&QueryOptions::new().skip(3).top(4).select(["RowKey"]))
        .await?;
    assert_eq!(row_keys(&entities), vec!["3", "4", "5", "6"]);
    assert!(entities.iter().all(|e| e.get("Age").is_none()));

    let filtered = service
        .get_entities(&QueryOptions::new().filter("Age ge 8"))
        .await?;
    assert_eq!(row_keys(&filtered), vec!["8", "9"]);
    Ok(())
}

#[tokio::test]
async fn test_field_problems_are_warnings() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    let record = RawRecord::object([
        ("PartitionKey", RawValue::from("P1")),
        ("RowKey", RawValue::from("1")),
        (
            "Count",
            RawValue::List(vec![RawValue::from(1), RawValue::from(2)]),
        ),
        ("Note", RawValue::Null),
    ]);
    let summary = service.add_entities(&[record], OperationKind::Add).await?;
    assert_eq!(
        summary.warnings,
        vec![
            ValidationWarning::UnsupportedFieldTypes {
                record_index: 0,
                fields: vec!["Count".to_string()],
            },
            ValidationWarning::NullFieldValues {
                record_index: 0,
                fields: vec!["Note".to_string()],
            },
        ]
    );
    let stored = store.entity(TABLE, "P1", "1").unwrap();
    assert_eq!(stored.get("Count"), Some(&EntityValue::from("[1,2]")));
    assert_eq!(stored.get("Note"), None);
    Ok(())
}

#[tokio::test]
async fn test_missing_identity_fails_before_any_write() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    let records = vec![
        person("P1", "1"),
        RawRecord::Hashtable(hashmap! {
            "PartitionKey".to_string() => RawValue::from("P1"),
            "Name".to_string() => RawValue::from("Bobby"),
        }),
    ];
    let err = service
        .add_entities(&records, OperationKind::Add)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TableError::MissingIdentityField {
            index: 1,
            type_name: "Hashtable",
            ..
        }
    ));
    assert_eq!(err.code(), OperationErrorCode::AddEntitiesError);
    assert!(store.transactions().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_repeated_identity_property_fails_validation() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    let records = vec![RawRecord::object([
        ("PartitionKey", "P1"),
        ("RowKey", "1"),
        ("PartitionKey", ""),
    ])];
    let err = service
        .add_entities(&records, OperationKind::Add)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TableError::MissingIdentityField {
            index: 0,
            type_name: "Object",
            ..
        }
    ));
    assert_eq!(err.code(), OperationErrorCode::AddEntitiesError);
    assert!(store.transactions().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_operation_kinds_are_checked_first() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    let err = service
        .add_entities(&[person("P1", "1")], OperationKind::UpdateMerge)
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::InvalidOperationKind { .. }));
    assert_eq!(err.code(), OperationErrorCode::AddEntitiesError);

    let err = service
        .update_entities(&[person("P1", "1")], OperationKind::Add, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), OperationErrorCode::UpdateEntitiesError);
    assert!(store.transactions().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unsupported_record_shape() -> anyhow::Result<()> {
    const OBJECTS_ONLY: ConverterRegistry = ConverterRegistry::new(&[&ObjectEntityConverter]);
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?.with_registry(OBJECTS_ONLY);
    assert_eq!(service.supported_entity_types(), vec!["Object"]);

    let record = RawRecord::SortedList(BTreeMap::from([
        ("PartitionKey".to_string(), RawValue::from("P1")),
        ("RowKey".to_string(), RawValue::from("1")),
    ]));
    let err = service
        .add_entities(&[record], OperationKind::Add)
        .await
        .unwrap_err();
    let TableError::UnsupportedEntityType {
        type_name,
        supported,
        ..
    } = &err
    else {
        panic!("unexpected error {err}");
    };
    assert_eq!(*type_name, "SortedList");
    assert_eq!(supported, &vec!["Object"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_transaction_keeps_earlier_commits() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    store.fail_transaction(1);
    let records: Vec<_> = (0..150).map(|i| person("P1", &format!("{i:03}"))).collect();
    let err = service
        .add_entities(&records, OperationKind::Add)
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Backend { .. }));
    assert_eq!(err.code(), OperationErrorCode::AddEntitiesError);

    let committed: Vec<_> = store.transactions().iter().map(|t| t.committed).collect();
    assert_eq!(committed, vec![true, false]);
    assert_eq!(store.rows(TABLE).len(), 100);
    Ok(())
}

#[tokio::test]
async fn test_existing_row_fails_add() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new().with_table(TABLE);
    store.insert(TABLE, Entity::new("P1", "2"))?;
    let service = connect(&store).await?;
    let err = service
        .add_entities(&[person("P1", "1"), person("P1", "2")], OperationKind::Add)
        .await
        .unwrap_err();
    let TableError::Backend { source, .. } = &err else {
        panic!("unexpected error {err}");
    };
    assert!(source.is_conflict());
    assert_eq!(source.short_msg(), "EntityAlreadyExists");
    // The transaction is atomic, so the first row wasn't added either.
    assert!(store.entity(TABLE, "P1", "1").is_none());
    Ok(())
}

#[tokio::test]
async fn test_canceled_operations_stop_before_the_backend() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let cancel = CancellationToken::new();
    let service = TableService::create_with_connection_string(
        &store,
        CONNECTION_STRING,
        Some(TABLE),
        true,
        cancel.clone(),
    )
    .await?;
    cancel.cancel();

    let err = service
        .add_entities(&[person("P1", "1")], OperationKind::Add)
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(err.code(), OperationErrorCode::AddEntitiesError);
    assert!(store.transactions().is_empty());

    let err = service
        .get_entities(&QueryOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(err.code(), OperationErrorCode::GetEntitiesError);
    Ok(())
}

#[tokio::test]
async fn test_clear_table() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let service = connect(&store).await?;
    let records = vec![
        person("P1", "1"),
        person("P1", "2"),
        person("P2", "1"),
        person("P1", "3"),
        person("P2", "2"),
    ];
    service.add_entities(&records, OperationKind::Add).await?;
    let summary = service.clear_table().await?;
    assert_eq!((summary.actions, summary.transactions), (5, 2));
    assert!(store.rows(TABLE).is_empty());
    assert!(store.has_table(TABLE));
    Ok(())
}

#[tokio::test]
async fn test_table_lifecycle() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new().with_table("Pets");
    let service = connect(&store).await?;
    service.create_table_if_not_exists().await?;
    service.create_table_if_not_exists().await?;
    assert_eq!(service.list_tables(None).await?, vec!["People", "Pets"]);
    assert_eq!(
        service.list_tables(Some("TableName eq 'Pets'")).await?,
        vec!["Pets"]
    );

    service.remove_table().await?;
    assert!(!store.has_table(TABLE));
    let err = service.remove_table().await.unwrap_err();
    assert_eq!(err.code(), OperationErrorCode::DeleteTableError);
    let TableError::Backend { source, .. } = &err else {
        panic!("unexpected error {err}");
    };
    assert!(source.is_not_found());
    assert!(source.msg().contains(TABLE));
    Ok(())
}

#[tokio::test]
async fn test_table_name_rules() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let err = TableService::create_with_account_key(
        &store,
        "bobby",
        "a2V5",
        Some("  "),
        true,
        CancellationToken::new(),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err.code(), OperationErrorCode::TableNameRequiredError);
    assert!(store.connections().is_empty());

    let err = TableService::create_with_token(
        &store,
        "bobby",
        "token",
        Some("my-table"),
        false,
        CancellationToken::new(),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err.code(), OperationErrorCode::InvalidTableNameError);

    let service = TableService::create_with_token(
        &store,
        "bobby",
        "token",
        None,
        false,
        CancellationToken::new(),
    )
    .await?;
    let err = service.clear_table().await.unwrap_err();
    assert!(matches!(err, TableError::TableNameRequired { .. }));
    assert_eq!(err.code(), OperationErrorCode::TableClientError);
    Ok(())
}

#[tokio::test]
async fn test_connection_failures_carry_the_connection_type() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    store.reject_connections();
    let provider = StaticCredentialProvider::new("token");
    let cancel = CancellationToken::new;
    let sas = url::Url::parse("https://bobby.table.core.windows.net/?sv=2019&sig=abc")?;

    let codes = vec![
        TableService::create_with_connection_string(&store, CONNECTION_STRING, None, false, cancel())
            .await
            .err()
            .map(|e| e.code()),
        TableService::create_with_sas(&store, &sas, Some(TABLE), false, cancel())
            .await
            .err()
            .map(|e| e.code()),
        TableService::create_with_account_key(&store, "bobby", "a2V5", None, false, cancel())
            .await
            .err()
            .map(|e| e.code()),
        TableService::create_with_token(&store, "bobby", "token", None, false, cancel())
            .await
            .err()
            .map(|e| e.code()),
        TableService::create_with_managed_identity(
            &store, &provider, "bobby", None, None, false, cancel(),
        )
        .await
        .err()
        .map(|e| e.code()),
    ];
    assert_eq!(
        codes,
        vec![
            Some(OperationErrorCode::ConnectWithConnectionStringError),
            Some(OperationErrorCode::ConnectWithSasError),
            Some(OperationErrorCode::ConnectWithStorageKeyError),
            Some(OperationErrorCode::ConnectWithTokenError),
            Some(OperationErrorCode::ConnectWithManagedIdentityError),
        ]
    );
    assert_eq!(
        OperationErrorCode::ConnectWithSasError.to_string(),
        "ConnectWithSASError"
    );
    Ok(())
}

#[tokio::test]
async fn test_managed_identity_without_token() -> anyhow::Result<()> {
    let store = InMemoryTableStore::new();
    let err = TableService::create_with_managed_identity(
        &store,
        &StaticCredentialProvider::unavailable(),
        "bobby",
        Some("1234"),
        Some(TABLE),
        false,
        CancellationToken::new(),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, TableError::Connection { .. }));
    assert_eq!(
        err.code(),
        OperationErrorCode::ConnectWithManagedIdentityError
    );
    assert!(store.connections().is_empty());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

    #[test]
    fn test_submitted_transactions_are_legal(
        partitions in prop::collection::vec(0..4u8, 0..350),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let store = InMemoryTableStore::new();
        let records: Vec<_> = partitions
            .iter()
            .enumerate()
            .map(|(i, p)| person(&format!("P{p}"), &i.to_string()))
            .collect();
        runtime.block_on(async {
            let service = connect(&store).await.unwrap();
            service.add_entities(&records, OperationKind::Add).await.unwrap();
        });

        let transactions = store.transactions();
        let mut per_partition: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (i, p) in partitions.iter().enumerate() {
            per_partition.entry(format!("P{p}")).or_default().push(i.to_string());
        }
        let expected_count: usize = per_partition.values().map(|keys| keys.len().div_ceil(100)).sum();
        prop_assert_eq!(transactions.len(), expected_count);

        let mut submitted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for transaction in &transactions {
            prop_assert!(!transaction.is_empty() && transaction.len() <= 100);
            let pk = transaction.partition_key().unwrap().to_string();
            for action in &transaction.actions {
                prop_assert_eq!(action.entity.partition_key(), Some(pk.as_str()));
                submitted
                    .entry(pk.clone())
                    .or_default()
                    .push(action.entity.row_key().unwrap().to_string());
            }
        }
        prop_assert_eq!(submitted, per_partition);
    }
}
