use port_forward::ForwardManager;

#[tokio::test]
async fn save_then_load_round_trips_rule_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forward.conf");

    let mgr = ForwardManager::new();
    mgr.add_rule(8080, "127.0.0.1".to_string(), 80, None)
        .await
        .unwrap();
    mgr.add_rule(
        9090,
        "internal.example.com".to_string(),
        9000,
        Some("internal admin panel".to_string()),
    )
    .await
    .unwrap();

    mgr.save_config(&path).await.unwrap();

    let reloaded = ForwardManager::new();
    reloaded.load_config(&path).await.unwrap();

    let rules = reloaded.list_rules().await;
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].listen_port, 8080);
    assert_eq!(rules[0].target_host, "127.0.0.1");
    assert_eq!(rules[0].target_port, 80);
    assert_eq!(rules[1].description, "internal admin panel");
}

#[tokio::test]
async fn saved_file_has_comment_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forward.conf");

    let mgr = ForwardManager::new();
    mgr.add_rule(1, "h".to_string(), 1, None).await.unwrap();
    mgr.save_config(&path).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(contents.lines().next().unwrap().starts_with('#'));
}

#[tokio::test]
async fn load_tolerates_three_field_lines_without_description() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forward.conf");
    tokio::fs::write(&path, "# header\n8080 10.0.0.5 80\n")
        .await
        .unwrap();

    let mgr = ForwardManager::new();
    mgr.load_config(&path).await.unwrap();

    let rules = mgr.list_rules().await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].description, "Forward 1 -> 10.0.0.5:80");
}

#[tokio::test]
async fn load_skips_blank_and_comment_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forward.conf");
    tokio::fs::write(&path, "# header\n\n# another comment\n1 a 1 rule-a\n\n2 b 2 rule-b\n")
        .await
        .unwrap();

    let mgr = ForwardManager::new();
    mgr.load_config(&path).await.unwrap();

    let rules = mgr.list_rules().await;
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].description, "rule-a");
    assert_eq!(rules[1].description, "rule-b");
}
