//! Scenarios run against a live PostgreSQL with pg_pb3_ld installed, read
//! back through `pg_logical_slot_get_binary_changes`.
//!
//! Run with: cargo test --test plugin_scenarios_test -- --ignored

mod common;

use common::{
    field_set, names, runs, table, values, PluginFixture, IDENTITY_FULL_FIELD_NAMES,
    TENK1_FIELD_NAMES, TENK1_FIELD_TYPE_OIDS,
};
use pg_pb3_fuzzer::wire::{
    BeginTransaction, CommitTransaction, DeleteDescription, InsertDescription,
    UpdateDescription, WireMessage,
};

const CRUD_SQL: &str = "
BEGIN;
INSERT INTO tenk1(unique1) VALUES (1);
UPDATE tenk1 SET unique2 = -20;
DELETE FROM tenk1;
COMMIT;
";

fn commit() -> WireMessage {
    WireMessage::Commit(CommitTransaction {})
}

/// Insert, update and delete of the CRUD script, with `decorate` applied
/// to every field set to add type oids or formats.
fn crud_messages(
    table_oid: u32,
    decorate: impl Fn(&mut pg_pb3_fuzzer::wire::FieldSetDescription),
) -> Vec<WireMessage> {
    let mut tenk1 = table("tenk1");
    tenk1.table_oid = table_oid;

    let mut inserted = field_set(
        names(&TENK1_FIELD_NAMES),
        values(16, &[b"1"]),
        runs(&[1, 15]),
    );
    let mut updated = field_set(
        names(&TENK1_FIELD_NAMES),
        values(16, &[b"1", b"-20"]),
        runs(&[2, 14]),
    );
    let mut key = field_set(names(&["unique1"]), values(1, &[b"1"]), runs(&[1]));
    decorate(&mut inserted);
    decorate(&mut updated);
    decorate(&mut key);

    vec![
        WireMessage::Insert(InsertDescription {
            table: Some(tenk1.clone()),
            new_values: Some(inserted),
        }),
        WireMessage::Update(UpdateDescription {
            table: Some(tenk1.clone()),
            key_fields: Some(key.clone()),
            new_values: Some(updated),
        }),
        WireMessage::Delete(DeleteDescription {
            table: Some(tenk1),
            key_fields: Some(key),
        }),
    ]
}

fn identity_full_insert(f2: Vec<u8>) -> WireMessage {
    WireMessage::Insert(InsertDescription {
        table: Some(table("tbl_identity_full")),
        new_values: Some(field_set(
            names(&IDENTITY_FULL_FIELD_NAMES),
            vec![b"1".to_vec(), f2],
            runs(&[2]),
        )),
    })
}

#[tokio::test]
#[ignore] // Run with: cargo test --test plugin_scenarios_test -- --ignored
async fn test_basic() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let mut expected = crud_messages(0, |_| {});
    expected.push(commit());
    assert_eq!(fixture.changes(CRUD_SQL, &[]).await, expected);

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_begin_commit() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let sql = "
BEGIN;
-- not decoded
INSERT INTO tbl_identity_nothing DEFAULT VALUES;
COMMIT;
";
    let options = [
        ("enable_begin_messages", "on"),
        ("enable_commit_messages", "on"),
    ];

    assert_eq!(
        fixture.changes(sql, &options).await,
        vec![WireMessage::Begin(BeginTransaction {}), commit()]
    );

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_message_length_corner_cases() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    // Each repeat length puts the encoded InsertDescription right below, at
    // or right above a varint width boundary.
    let mut lengths = vec![110, 111, 112, 16365, 16366, 16367, 2097132, 2097133, 2097134];
    if std::env::var("TEST_MASSIVE_EMBEDDED_MESSAGE").as_deref() == Ok("PLEASE") {
        lengths.extend([268435435, 268435436, 268435437]);
    }

    let mut sql = String::from("BEGIN;\n");
    for len in &lengths {
        sql.push_str(&format!(
            "INSERT INTO tbl_identity_full (f1, f2) VALUES (1, repeat('j', {}));\n",
            len
        ));
    }
    sql.push_str("COMMIT;\n");

    let options = [
        ("enable_begin_messages", "off"),
        ("enable_commit_messages", "off"),
    ];
    let expected: Vec<WireMessage> = lengths
        .iter()
        .map(|&len| identity_full_insert(vec![b'j'; len]))
        .collect();

    let received = fixture.changes(&sql, &options).await;
    assert_eq!(received.len(), expected.len());
    for (idx, (got, want)) in received.iter().zip(&expected).enumerate() {
        assert!(got == want, "message {} does not match for length {}", idx, lengths[idx]);
    }

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_table_oids() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;
    let oid = fixture.table_oid("tenk1").await;

    let mut expected = crud_messages(oid, |_| {});
    expected.push(commit());
    assert_eq!(
        fixture.changes(CRUD_SQL, &[("enable_table_oids", "on")]).await,
        expected
    );

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_varatt_external_ondisk() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let sql = "
BEGIN;
ALTER TABLE tenk1 ALTER COLUMN string4 SET STORAGE EXTERNAL;
INSERT INTO tenk1(unique1, unique2, string4)
SELECT 1, 10, repeat('j', 9001);
UPDATE tenk1 SET unique2 = 20;
DELETE FROM tenk1;
COMMIT;
";
    let options = [("type_oids_mode", "full"), ("formats_mode", "full")];

    let full = |names: &[&str], values: Vec<Vec<u8>>, nulls: Vec<u8>| {
        let mut fsd = field_set(common::names(names), values, nulls);
        fsd.type_oids = TENK1_FIELD_TYPE_OIDS[..names.len()].to_vec();
        fsd.formats = vec![0; names.len()];
        fsd
    };

    let toasted = vec![b'j'; 9001];
    let mut inserted_values = values(16, &[b"1", b"10"]);
    inserted_values[15] = toasted;
    let key = full(&["unique1"], values(1, &[b"1"]), runs(&[1]));

    let expected = vec![
        WireMessage::Insert(InsertDescription {
            table: Some(table("tenk1")),
            new_values: Some(full(&TENK1_FIELD_NAMES, inserted_values, runs(&[2, 13, 1]))),
        }),
        // the unchanged toasted column is left out of the new tuple
        WireMessage::Update(UpdateDescription {
            table: Some(table("tenk1")),
            key_fields: Some(key.clone()),
            new_values: Some(full(
                &TENK1_FIELD_NAMES[..15],
                values(15, &[b"1", b"20"]),
                runs(&[2, 13]),
            )),
        }),
        WireMessage::Delete(DeleteDescription {
            table: Some(table("tenk1")),
            key_fields: Some(key),
        }),
        commit(),
    ];

    assert_eq!(fixture.changes(sql, &options).await, expected);

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_binary_field() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let options = [
        ("enable_commit_messages", "no"),
        ("binary_oid_ranges", "1,2-2,3-400,401-4000"),
    ];
    let expected = vec![WireMessage::Insert(InsertDescription {
        table: Some(table("tenk1")),
        new_values: Some(field_set(
            names(&TENK1_FIELD_NAMES),
            values(16, &[&[0, 0, 0, 1]]),
            runs(&[1, 15]),
        )),
    })];

    assert_eq!(
        fixture
            .changes("INSERT INTO tenk1(unique1) VALUES (1);", &options)
            .await,
        expected
    );

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_varlen_binary_field() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let options = [
        ("enable_commit_messages", "no"),
        ("binary_oid_ranges", "25"),
    ];
    let mut fields = values(16, &[b"2"]);
    fields[15] = b"foobarbaz".to_vec();
    let expected = vec![WireMessage::Insert(InsertDescription {
        table: Some(table("tenk1")),
        new_values: Some(field_set(
            names(&TENK1_FIELD_NAMES),
            fields,
            runs(&[1, 14, 1]),
        )),
    })];

    assert_eq!(
        fixture
            .changes(
                "INSERT INTO tenk1(unique1, string4) VALUES (2, 'foobarbaz');",
                &options
            )
            .await,
        expected
    );

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_large_embedded_message() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let mut fields = values(16, &[b"1"]);
    fields[15] = vec![b'j'; 16384];
    let expected = vec![
        WireMessage::Insert(InsertDescription {
            table: Some(table("tenk1")),
            new_values: Some(field_set(
                names(&TENK1_FIELD_NAMES),
                fields,
                runs(&[1, 14, 1]),
            )),
        }),
        commit(),
    ];

    assert_eq!(
        fixture
            .changes(
                "INSERT INTO tenk1(unique1, string4) SELECT 1, repeat('j', 16384)",
                &[]
            )
            .await,
        expected
    );

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_type_oids_omit_nulls() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let options = [
        ("type_oids_mode", "omit_nulls"),
        ("enable_commit_messages", "no"),
    ];
    let expected = crud_messages(0, |fsd| {
        let non_null = fsd.nulls.iter().filter(|&&n| n == 0).count();
        fsd.type_oids = TENK1_FIELD_TYPE_OIDS[..non_null].to_vec();
    });

    assert_eq!(fixture.changes(CRUD_SQL, &options).await, expected);

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_type_oids_full() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let options = [
        ("type_oids_mode", "full"),
        ("enable_commit_messages", "no"),
    ];
    let expected = crud_messages(0, |fsd| {
        fsd.type_oids = TENK1_FIELD_TYPE_OIDS[..fsd.names.len()].to_vec();
    });

    assert_eq!(fixture.changes(CRUD_SQL, &options).await, expected);

    fixture.teardown().await;
}

async fn assert_unique1_formats(options: &[(&str, &str)], unique1: &[u8], formats: Vec<u8>) {
    let fixture = PluginFixture::setup().await;

    let mut fsd = field_set(
        names(&TENK1_FIELD_NAMES),
        values(16, &[unique1]),
        runs(&[1, 15]),
    );
    fsd.formats = formats;
    let expected = vec![WireMessage::Insert(InsertDescription {
        table: Some(table("tenk1")),
        new_values: Some(fsd),
    })];

    assert_eq!(
        fixture
            .changes("INSERT INTO tenk1(unique1) VALUES (1);", options)
            .await,
        expected
    );

    fixture.teardown().await;
}

async fn assert_identity_full_formats(mode: &str) {
    let fixture = PluginFixture::setup().await;

    let options = [
        ("enable_commit_messages", "no"),
        ("binary_oid_ranges", "23,25"),
        ("formats_mode", mode),
    ];
    let mut fsd = field_set(
        names(&IDENTITY_FULL_FIELD_NAMES),
        vec![vec![0, 0, 0, 1], b"2".to_vec()],
        runs(&[2]),
    );
    fsd.formats = vec![1, 1];
    let expected = vec![WireMessage::Insert(InsertDescription {
        table: Some(table("tbl_identity_full")),
        new_values: Some(fsd),
    })];

    assert_eq!(
        fixture
            .changes("INSERT INTO tbl_identity_full(f1,f2) VALUES (1,'2');", &options)
            .await,
        expected
    );

    fixture.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_formats_libpq_mixed() {
    let _serial = common::serial();
    let options = [
        ("enable_commit_messages", "no"),
        ("binary_oid_ranges", "2-400,401-4000"),
        ("formats_mode", "libpq"),
    ];
    assert_unique1_formats(&options, &[0, 0, 0, 1], runs(&[0, 1, 15])).await;
}

#[tokio::test]
#[ignore]
async fn test_formats_libpq_all_text() {
    let _serial = common::serial();
    let options = [
        ("enable_commit_messages", "no"),
        ("formats_mode", "libpq"),
    ];
    assert_unique1_formats(&options, b"1", Vec::new()).await;
}

#[tokio::test]
#[ignore]
async fn test_formats_libpq_all_binary() {
    let _serial = common::serial();
    assert_identity_full_formats("libpq").await;
}

#[tokio::test]
#[ignore]
async fn test_formats_full_mixed() {
    let _serial = common::serial();
    let options = [
        ("enable_commit_messages", "no"),
        ("binary_oid_ranges", "2-400,401-4000"),
        ("formats_mode", "full"),
    ];
    assert_unique1_formats(&options, &[0, 0, 0, 1], runs(&[0, 1, 15])).await;
}

#[tokio::test]
#[ignore]
async fn test_formats_full_all_text() {
    let _serial = common::serial();
    let options = [
        ("enable_commit_messages", "no"),
        ("formats_mode", "full"),
    ];
    assert_unique1_formats(&options, b"1", vec![0; 16]).await;
}

#[tokio::test]
#[ignore]
async fn test_formats_full_all_binary() {
    let _serial = common::serial();
    assert_identity_full_formats("full").await;
}

#[tokio::test]
#[ignore]
async fn test_binary_oid_ranges_input() {
    let _serial = common::serial();
    let fixture = PluginFixture::setup().await;

    let cases: &[(&str, Option<&str>)] = &[
        ("foo", Some("invalid input syntax for integer")),
        ("0", Some("oid can't be InvalidOid")),
        ("0-0", Some("oid can't be InvalidOid")),
        ("0-1", Some("oid can't be InvalidOid")),
        ("-1", Some("invalid input syntax for integer")),
        ("1", None),
        ("4294967295", None),
        ("4294967296", Some("oids can't be larger than OID_MAX")),
        ("1,", Some("invalid input syntax for binary_oid_ranges")),
        ("1-", Some("invalid input syntax for integer")),
        ("1-,", Some("invalid input syntax for binary_oid_ranges")),
        ("1,2", None),
        ("2-1", Some("the upper bound of a range can't be lower than its lower bound")),
        ("1,1-2", Some("overlaps with range")),
        ("1-3,2-4", Some("overlaps with range")),
        ("1,2,3,4,5,6,7,8,9,10", None),
        ("1-2,3,4-5", None),
    ];

    for &(input, expected_error) in cases {
        let result = fixture.try_options(&[("binary_oid_ranges", input)]).await;
        match (result, expected_error) {
            (Ok(()), None) => {}
            (Err(message), Some(expected)) => assert!(
                message.contains(expected),
                "{:?} failed with {:?}, expected {:?}",
                input,
                message,
                expected
            ),
            (Ok(()), Some(expected)) => panic!("{:?} succeeded, expected {:?}", input, expected),
            (Err(message), None) => panic!("{:?} failed unexpectedly: {}", input, message),
        }

        // the local parser agrees with the plugin
        let local: Result<pg_pb3_fuzzer::options::BinaryOidRanges, _> = input.parse();
        assert_eq!(local.is_ok(), expected_error.is_none(), "{:?}", input);
    }

    fixture.teardown().await;
}
