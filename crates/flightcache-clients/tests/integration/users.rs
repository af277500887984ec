use std::time::Duration;

use flightcache::{CacheConfig, EntryStatus};
use flightcache_clients::users::{HttpUserSource, UserDirectory, UserError};
use flightcache_test::{self as test, UsersServer};

fn directory(server: &UsersServer, path: &str) -> UserDirectory {
    let source = HttpUserSource::new(server.url(path)).timeout(Duration::from_secs(5));
    UserDirectory::new(source, CacheConfig::named("users"))
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_request() {
    test::setup();
    let server = UsersServer::new();
    let directory = directory(&server, "/");

    let lookups = (0..10).map(|_| directory.get_user_by_id(1));
    let users = futures::future::join_all(lookups).await;

    for user in &users {
        let user = user.as_ref().unwrap();
        assert_eq!(user.user_id, 1);
        assert_eq!(user.name, "Alice");
    }
    assert_eq!(server.all_hits(), [("/v1/users/1".to_owned(), 1)]);

    // served from memory from now on
    assert_eq!(directory.get_user_by_id(1).await.unwrap().name, "Alice");
    assert_eq!(server.accesses(), 0);
    assert_eq!(directory.cache().status(&1), Some(EntryStatus::Succeeded));
}

#[tokio::test]
async fn test_not_found() {
    test::setup();
    let server = UsersServer::new();
    let directory = directory(&server, "/");

    let (a, b) = futures::join!(directory.get_user_by_id(42), directory.get_user_by_id(42));
    assert_eq!(a, Err(UserError::NotFound(42)));
    assert_eq!(b, Err(UserError::NotFound(42)));
    assert_eq!(server.accesses(), 1);

    // failures are not cached
    assert_eq!(directory.cache().status(&42), None);
    assert_eq!(
        directory.get_user_by_id(42).await,
        Err(UserError::NotFound(42))
    );
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_retry_after_server_error() {
    test::setup();
    let server = UsersServer::new();
    server.fail_next(2, 1);
    let directory = directory(&server, "/");

    let (a, b) = futures::join!(directory.get_user_by_id(2), directory.get_user_by_id(2));
    assert_eq!(a, Err(UserError::Status(500)));
    assert_eq!(b, Err(UserError::Status(500)));

    let user = directory.get_user_by_id(2).await.unwrap();
    assert_eq!(user.name, "Bob");
    assert_eq!(server.all_hits(), [("/v1/users/2".to_owned(), 2)]);
}

#[tokio::test]
async fn test_independent_users() {
    test::setup();
    let server = UsersServer::new();
    server.fail_next(3, 1);
    let directory = directory(&server, "/");

    let users = directory.list_users(&[1, 3, 1, 2]).await;
    assert_eq!(users[0].as_ref().unwrap().name, "Alice");
    assert_eq!(users[1], Err(UserError::Status(500)));
    assert_eq!(users[2].as_ref().unwrap().name, "Alice");
    assert_eq!(users[3].as_ref().unwrap().name, "Bob");

    assert_eq!(
        server.all_hits(),
        [
            ("/v1/users/1".to_owned(), 1),
            ("/v1/users/2".to_owned(), 1),
            ("/v1/users/3".to_owned(), 1),
        ]
    );
    assert_eq!(directory.cache().len(), 2);
}

#[tokio::test]
async fn test_malformed_response() {
    test::setup();
    let server = UsersServer::new();
    let directory = directory(&server, "/garbage/");

    let err = directory.get_user_by_id(1).await.unwrap_err();
    assert!(matches!(err, UserError::Malformed(_)), "{err:?}");
    assert_eq!(server.all_hits(), [("/garbage/v1/users/1".to_owned(), 1)]);
}

#[tokio::test]
async fn test_timeout() {
    test::setup();
    let server = UsersServer::with_delay(Duration::from_secs(2));
    let source = HttpUserSource::new(server.url("/")).timeout(Duration::from_millis(100));
    let directory = UserDirectory::new(source, CacheConfig::named("users"));

    assert_eq!(
        directory.get_user_by_id(1).await,
        Err(UserError::Timeout(Duration::from_millis(100)))
    );
}

#[tokio::test]
async fn test_unreachable_service() {
    test::setup();
    // nothing listens on a port that was just released
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap())
        .parse()
        .unwrap();
    drop(listener);

    let directory = UserDirectory::new(HttpUserSource::new(url), CacheConfig::named("users"));
    let err = directory.get_user_by_id(1).await.unwrap_err();
    assert!(matches!(err, UserError::Transport(_)), "{err:?}");
}
