use concord_types::ItemKey;

#[test]
fn display_and_parse() {
    let key = ItemKey::new("fund_nav", "F-001").unwrap();
    assert_eq!(key.to_string(), "fund_nav:F-001");
    let parsed: ItemKey = "fund_nav:F-001".parse().unwrap();
    assert_eq!(parsed, key);
}

#[test]
fn id_part_may_contain_colons() {
    let parsed: ItemKey = "quote:XNAS:AAPL".parse().unwrap();
    assert_eq!(parsed.item_type, "quote");
    assert_eq!(parsed.item_id, "XNAS:AAPL");
}

#[test]
fn rejects_empty_components() {
    assert!(ItemKey::new("", "x").is_err());
    assert!(ItemKey::new("x", "").is_err());
    assert!(":x".parse::<ItemKey>().is_err());
}

#[test]
fn rejects_colon_in_type() {
    assert!(ItemKey::new("a:b", "c").is_err());
}

#[test]
fn rejects_missing_separator() {
    assert!("no-separator".parse::<ItemKey>().is_err());
}

#[test]
fn storage_key_matches_display() {
    let key = ItemKey::new("t", "1").unwrap();
    assert_eq!(key.storage_key(), key.to_string());
}
