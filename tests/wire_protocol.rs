use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use workbay::model::Event;
use workbay::scheduler::Scheduler;
use workbay::shop::ShopManager;
use workbay::wire;

/// 2030-01-07T00:00:00Z, a Monday.
const MIDNIGHT: i64 = 1_893_974_400_000;
const HOUR: i64 = 3_600_000;
const DAY: &str = "2030-01-07";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    start_test_server_with_shops().await.0
}

/// Also hands back the shop registry, for tests that watch engine events.
async fn start_test_server_with_shops() -> (SocketAddr, Arc<ShopManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("workbay_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let shops = Arc::new(ShopManager::new(dir, 1000));
    let scheduler = Arc::new(Scheduler::default());
    let registry = shops.clone();

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let shops = shops.clone();
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, shops, scheduler, "workbay".to_string(), None).await;
            });
        }
    });

    (addr, registry)
}

async fn connect(addr: SocketAddr, shop: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(shop)
        .user("workbay")
        .password("workbay");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn availability(client: &tokio_postgres::Client, minutes: u32) -> Vec<SimpleQueryRow> {
    rows(
        client,
        &format!("SELECT * FROM availability WHERE date = '{DAY}' AND duration = {minutes}"),
    )
    .await
}

fn visit_sql(id: Ulid, mechanic: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO visits (id, mechanic_id, client_id, vehicle_id, start, "end", services)
           VALUES ('{id}', '{mechanic}', '{}', '{}', {start}, {end}, '["{}"]')"#,
        Ulid::new(),
        Ulid::new(),
        Ulid::new()
    )
}

fn code(err: &tokio_postgres::Error) -> Option<&SqlState> {
    err.code()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_walk_a_visit_through_its_lifecycle() {
    let addr = start_test_server().await;
    let client = connect(addr, "main_street").await;

    let ana = Ulid::new();
    client
        .simple_query(&format!("INSERT INTO mechanics (id, name) VALUES ('{ana}', 'Ana')"))
        .await
        .unwrap();

    let slots = availability(&client, 60).await;
    assert_eq!(slots.len(), 17);
    assert_eq!(slots[0].get("mechanic_id"), Some(ana.to_string().as_str()));
    assert_eq!(slots[0].get("mechanic_name"), Some("Ana"));
    assert_eq!(slots[0].get("start"), Some((MIDNIGHT + 9 * HOUR).to_string().as_str()));

    let visit = Ulid::new();
    client
        .simple_query(&visit_sql(visit, ana, MIDNIGHT + 10 * HOUR, MIDNIGHT + 11 * HOUR))
        .await
        .unwrap();
    assert_eq!(availability(&client, 60).await.len(), 14);

    // Same hour shifted by 30 minutes.
    let err = client
        .simple_query(&visit_sql(
            Ulid::new(),
            ana,
            MIDNIGHT + 10 * HOUR + HOUR / 2,
            MIDNIGHT + 11 * HOUR + HOUR / 2,
        ))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::T_R_SERIALIZATION_FAILURE));

    // Touching the booked hour is fine.
    client
        .simple_query(&visit_sql(Ulid::new(), ana, MIDNIGHT + 11 * HOUR, MIDNIGHT + 12 * HOUR))
        .await
        .unwrap();

    let err = client
        .simple_query(&format!(
            "INSERT INTO visit_transitions (visit_id, status) VALUES ('{visit}', 'done')"
        ))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE));

    client
        .simple_query(&format!(
            "INSERT INTO visit_transitions (visit_id, status) VALUES ('{visit}', 'in-progress')"
        ))
        .await
        .unwrap();

    let found = rows(&client, &format!("SELECT * FROM visits WHERE id = '{visit}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("status"), Some("in-progress"));
    assert_eq!(found[0].get("mechanic_id"), Some(ana.to_string().as_str()));
    assert!(found[0].get("services").unwrap().starts_with("[\""));

    let all = rows(&client, &format!("SELECT * FROM visits WHERE mechanic_id = '{ana}'")).await;
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn shops_do_not_share_mechanics() {
    let addr = start_test_server().await;
    let north = connect(addr, "north").await;
    let south = connect(addr, "south").await;

    north
        .simple_query(&format!("INSERT INTO mechanics VALUES ('{}', 'Ana')", Ulid::new()))
        .await
        .unwrap();

    assert_eq!(rows(&north, "SELECT * FROM mechanics").await.len(), 1);
    assert!(rows(&south, "SELECT * FROM mechanics").await.is_empty());
    assert!(availability(&south, 60).await.is_empty());
}

#[tokio::test]
async fn errors_carry_stable_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr, "errors").await;

    let err = client.simple_query("SELEKT 1").await.unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::SYNTAX_ERROR));

    let err = client
        .simple_query(&format!("SELECT * FROM availability WHERE date = '{DAY}' AND duration = 0"))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let err = client
        .simple_query(&visit_sql(Ulid::new(), Ulid::new(), MIDNIGHT + 10 * HOUR, MIDNIGHT + 11 * HOUR))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::NO_DATA_FOUND));

    let ana = Ulid::new();
    client
        .simple_query(&format!("INSERT INTO mechanics VALUES ('{ana}', 'Ana')"))
        .await
        .unwrap();
    let err = client
        .simple_query(&format!("INSERT INTO mechanics VALUES ('{ana}', 'Ana again')"))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::UNIQUE_VIOLATION));

    // Outside business hours.
    let err = client
        .simple_query(&visit_sql(Ulid::new(), ana, MIDNIGHT + 7 * HOUR, MIDNIGHT + 8 * HOUR))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));

    client
        .simple_query(&visit_sql(Ulid::new(), ana, MIDNIGHT + 9 * HOUR, MIDNIGHT + 10 * HOUR))
        .await
        .unwrap();
    let err = client
        .simple_query(&format!("DELETE FROM mechanics WHERE id = '{ana}'"))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(&SqlState::FOREIGN_KEY_VIOLATION));
}

#[tokio::test]
async fn concurrent_clients_get_one_booking() {
    let addr = start_test_server().await;
    let admin = connect(addr, "race").await;
    let ana = Ulid::new();
    admin
        .simple_query(&format!("INSERT INTO mechanics VALUES ('{ana}', 'Ana')"))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        tasks.push(tokio::spawn(async move {
            let client = connect(addr, "race").await;
            client
                .simple_query(&visit_sql(Ulid::new(), ana, MIDNIGHT + 14 * HOUR, MIDNIGHT + 15 * HOUR))
                .await
        }));
    }

    let mut booked = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => booked += 1,
            Err(e) => assert_eq!(code(&e), Some(&SqlState::T_R_SERIALIZATION_FAILURE)),
        }
    }
    assert_eq!(booked, 1);
    assert_eq!(rows(&admin, "SELECT * FROM visits").await.len(), 1);
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr, "extended").await;

    let ana = Ulid::new().to_string();
    let inserted = client
        .execute("INSERT INTO mechanics (id, name) VALUES ($1, $2)", &[&ana, &"Ana"])
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let mechanics = client.query("SELECT * FROM mechanics", &[]).await.unwrap();
    assert_eq!(mechanics.len(), 1);
    assert_eq!(mechanics[0].get::<_, String>("name"), "Ana");

    let slots = client
        .query(
            "SELECT * FROM availability WHERE date = $1 AND duration = $2",
            &[&DAY, &"120"],
        )
        .await
        .unwrap();
    // 09:00 through 16:00 inclusive
    assert_eq!(slots.len(), 15);
    assert_eq!(slots[0].get::<_, i64>("start"), MIDNIGHT + 9 * HOUR);
    assert_eq!(slots[14].get::<_, i64>("end"), MIDNIGHT + 18 * HOUR);
}

#[tokio::test]
async fn wire_bookings_reach_board_subscribers() {
    let (addr, shops) = start_test_server_with_shops().await;
    let client = connect(addr, "board").await;

    let ana = Ulid::new();
    client
        .simple_query(&format!("INSERT INTO mechanics VALUES ('{ana}', 'Ana')"))
        .await
        .unwrap();
    let mut board = shops.get_or_create("board").unwrap().notify.subscribe(ana);

    let visit = Ulid::new();
    client
        .simple_query(&visit_sql(visit, ana, MIDNIGHT + 9 * HOUR, MIDNIGHT + 10 * HOUR))
        .await
        .unwrap();
    match board.recv().await.unwrap() {
        Event::VisitBooked { id, mechanic_id, .. } => {
            assert_eq!(id, visit);
            assert_eq!(mechanic_id, ana);
        }
        other => panic!("expected VisitBooked, got {other:?}"),
    }
}
