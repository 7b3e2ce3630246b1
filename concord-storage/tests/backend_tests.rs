use concord_storage::{
    KvBackend, MemoryBackend, SqliteBackend, StorageError, get_json, list_json, put_json,
};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    name: String,
    count: u32,
}

fn backends() -> Vec<Box<dyn KvBackend>> {
    vec![
        Box::new(MemoryBackend::new()),
        Box::new(SqliteBackend::open_in_memory().unwrap()),
    ]
}

#[test]
fn put_and_get() {
    for backend in backends() {
        backend.put("ns", "a", "1").unwrap();
        assert_eq!(backend.get("ns", "a").unwrap(), Some("1".to_string()), "{}", backend.name());
        assert_eq!(backend.get("ns", "missing").unwrap(), None);
        assert_eq!(backend.get("other", "a").unwrap(), None);
    }
}

#[test]
fn put_replaces_existing_value() {
    for backend in backends() {
        backend.put("ns", "a", "1").unwrap();
        backend.put("ns", "a", "2").unwrap();
        assert_eq!(backend.get("ns", "a").unwrap(), Some("2".to_string()));
        assert_eq!(backend.list("ns").unwrap().len(), 1);
    }
}

#[test]
fn delete_reports_presence() {
    for backend in backends() {
        backend.put("ns", "a", "1").unwrap();
        assert!(backend.delete("ns", "a").unwrap());
        assert!(!backend.delete("ns", "a").unwrap());
        assert!(!backend.delete("never", "a").unwrap());
    }
}

#[test]
fn list_is_ordered_and_scoped() {
    for backend in backends() {
        backend.put("ns", "b", "2").unwrap();
        backend.put("ns", "a", "1").unwrap();
        backend.put("elsewhere", "c", "3").unwrap();
        assert_eq!(
            backend.list("ns").unwrap(),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }
}

#[test]
fn clear_removes_only_namespace() {
    for backend in backends() {
        backend.put("ns", "a", "1").unwrap();
        backend.put("ns", "b", "2").unwrap();
        backend.put("keep", "c", "3").unwrap();
        assert_eq!(backend.clear("ns").unwrap(), 2);
        assert!(backend.list("ns").unwrap().is_empty());
        assert_eq!(backend.list("keep").unwrap().len(), 1);
    }
}

#[test]
fn json_helpers_roundtrip_records() {
    for backend in backends() {
        let record = Record { name: "nav".into(), count: 3 };
        put_json(backend.as_ref(), "records", "r1", &record).unwrap();
        let loaded: Option<Record> = get_json(backend.as_ref(), "records", "r1").unwrap();
        assert_eq!(loaded, Some(record.clone()));

        let all: Vec<(String, Record)> = list_json(backend.as_ref(), "records").unwrap();
        assert_eq!(all, vec![("r1".to_string(), record)]);
    }
}

#[test]
fn get_json_reports_malformed_data() {
    let backend = MemoryBackend::new();
    backend.put("records", "bad", "{not json").unwrap();
    let err = get_json::<Record>(&backend, "records", "bad").unwrap_err();
    assert!(matches!(err, StorageError::Serialization(_)));
}

#[test]
fn sqlite_file_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concord.db");

    {
        let backend = SqliteBackend::open(&path).unwrap();
        backend.put("versions", "fund:1", "{}").unwrap();
    }

    let reopened = SqliteBackend::open(&path).unwrap();
    assert_eq!(reopened.get("versions", "fund:1").unwrap(), Some("{}".to_string()));
}
