use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;
/// 2030-01-07T00:00:00Z
const MIDNIGHT: i64 = 1_893_974_400_000;
/// Slots per day with the default 09:00-18:00 hours.
const HOURS_PER_DAY: i64 = 9;

async fn connect(host: &str, port: u16, shop: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(shop)
        .user("workbay")
        .password("workbay");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_shop() -> String {
    format!("bench_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// The `n`th one-hour slot counting from Monday 09:00, skipping closed hours.
fn nth_hour(n: i64) -> (i64, i64) {
    let start = MIDNIGHT + (n / HOURS_PER_DAY) * DAY + (9 + n % HOURS_PER_DAY) * HOUR;
    (start, start + HOUR)
}

async fn add_mechanic(client: &tokio_postgres::Client, name: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO mechanics (id, name) VALUES ('{id}', '{name}')"))
        .await
        .unwrap();
    id
}

fn visit_sql(mechanic: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO visits (id, mechanic_id, client_id, vehicle_id, start, "end", services) VALUES ('{}', '{mechanic}', '{}', '{}', {start}, {end}, '["{}"]')"#,
        Ulid::new(),
        Ulid::new(),
        Ulid::new(),
        Ulid::new()
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_shop()).await;
    let mid = add_mechanic(&client, "Ana").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let (s, e) = nth_hour(i as i64);
        let t = Instant::now();
        client.batch_execute(&visit_sql(mid, s, e)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many clients race for the same slot, round after round. Exactly one per
/// round should win.
async fn phase2_contention(host: &str, port: u16) {
    let shop = fresh_shop();
    let admin = connect(host, port, &shop).await;
    let mid = add_mechanic(&admin, "Ana").await;

    let n_clients = 16;
    let rounds = 100;
    let mut clients = Vec::with_capacity(n_clients);
    for _ in 0..n_clients {
        clients.push(Arc::new(connect(host, port, &shop).await));
    }

    let booked = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let mut latencies = Vec::new();
    let start = Instant::now();

    for round in 0..rounds {
        let (s, e) = nth_hour(round);
        let mut handles = Vec::with_capacity(n_clients);
        for client in &clients {
            let client = client.clone();
            let booked = booked.clone();
            let rejected = rejected.clone();
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                match client.batch_execute(&visit_sql(mid, s, e)).await {
                    Ok(()) => booked.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
                t.elapsed()
            }));
        }
        for h in handles {
            latencies.push(h.await.unwrap());
        }
    }

    let elapsed = start.elapsed();
    let booked = booked.load(Ordering::Relaxed);
    let rejected = rejected.load(Ordering::Relaxed);
    println!(
        "  {rounds} rounds x {n_clients} clients in {:.2}s: {booked} booked, {rejected} rejected",
        elapsed.as_secs_f64()
    );
    if booked != rounds as usize {
        println!("  WARNING: expected exactly {rounds} bookings");
    }
    print_latency("contended booking latency", &mut latencies);
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let shop = fresh_shop();
    let setup_client = connect(host, port, &shop).await;
    let mut mechanics = Vec::new();
    for i in 0..10 {
        mechanics.push(add_mechanic(&setup_client, &format!("mechanic_{i}")).await);
    }
    // A few bookings on the measured day so slot generation has gaps to skip.
    for (i, mid) in mechanics.iter().enumerate() {
        let (s, e) = nth_hour(i as i64 % HOURS_PER_DAY);
        setup_client.batch_execute(&visit_sql(*mid, s, e)).await.unwrap();
    }
    drop(setup_client);

    // Writers book later days so reads of the first day stay comparable.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for (w, mid) in mechanics.iter().copied().enumerate().take(5) {
        let host = host.to_string();
        let shop = shop.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &shop).await;
            let mut i = HOURS_PER_DAY * (1 + w as i64 * 1000);
            while !stop.load(Ordering::Relaxed) {
                let (s, e) = nth_hour(i);
                let _ = client.batch_execute(&visit_sql(mid, s, e)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let shop = shop.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &shop).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query("SELECT * FROM availability WHERE date = '2030-01-07' AND duration = 60")
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_shop()).await;
            let mid = add_mechanic(&client, "Ana").await;
            for i in 0..ops_per_conn {
                let (s, e) = nth_hour(i);
                client.batch_execute(&visit_sql(mid, s, e)).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("WORKBAY_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("WORKBAY_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid WORKBAY_PORT");

    println!("=== workbay stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contention on one slot");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
