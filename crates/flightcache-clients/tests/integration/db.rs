use std::time::Duration;

use flightcache::CacheConfig;
use flightcache_clients::db::{DbClient, DbError, SimulatedDatabase};
use flightcache_test as test;

#[tokio::test]
async fn test_concurrent_requests_share_one_connection() {
    test::setup();
    let database = SimulatedDatabase::new(Duration::from_millis(50));
    let client = DbClient::new(database.clone(), CacheConfig::named("db"));

    let (a, b) = futures::join!(client.get_record("record1"), client.get_record("record2"));
    assert_eq!(a.unwrap().payload, "record record1 via connection #1");
    assert_eq!(b.unwrap().payload, "record record2 via connection #1");
    assert_eq!(database.connects(), 1);
    assert_eq!(database.queries(), 2);
}

#[tokio::test]
async fn test_failed_connect_is_retried() {
    test::setup();
    let database = SimulatedDatabase::with_failing_connects(Duration::from_millis(10), 1);
    let client = DbClient::new(database.clone(), CacheConfig::named("db"));

    let (a, b) = futures::join!(client.get_record("record1"), client.get_record("record2"));
    let refused = Err(DbError::Connect("connection #1 refused".into()));
    assert_eq!(a, refused);
    assert_eq!(b, refused);
    assert_eq!(database.connects(), 1);
    assert!(!client.is_connected());

    let record = client.get_record("record1").await.unwrap();
    assert_eq!(record.payload, "record record1 via connection #2");
    assert_eq!(database.connects(), 2);
    assert_eq!(database.queries(), 1);
}

#[tokio::test]
async fn test_reset_reconnects() {
    test::setup();
    let database = SimulatedDatabase::new(Duration::from_millis(10));
    let client = DbClient::new(database.clone(), CacheConfig::named("db"));

    assert!(!client.reset());
    client.get_record("record1").await.unwrap();
    assert!(client.reset());
    assert!(!client.is_connected());

    let record = client.get_record("record1").await.unwrap();
    assert_eq!(record.payload, "record record1 via connection #2");
    assert_eq!(database.connects(), 2);
}

#[tokio::test]
async fn test_connection_retention() {
    test::setup();
    tokio::time::pause();

    let database = SimulatedDatabase::new(Duration::from_millis(10));
    let config = CacheConfig {
        retention: Some(Duration::from_secs(60)),
        ..CacheConfig::named("db")
    };
    let client = DbClient::new(database.clone(), config);

    client.get_record("record1").await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    client.get_record("record1").await.unwrap();
    assert_eq!(database.connects(), 1);

    tokio::time::advance(Duration::from_secs(120)).await;
    let record = client.get_record("record1").await.unwrap();
    assert_eq!(record.payload, "record record1 via connection #2");
    assert_eq!(database.connects(), 2);
}
