use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, NaiveTime, TimeDelta};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const SLOT_MINUTES: i64 = 30;

async fn connect(host: &str, port: u16, user: &str, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotbook")
        .user(user)
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl Target {
    async fn connect(&self) -> Client {
        connect(&self.host, self.port, &self.user, &self.password).await
    }
}

#[derive(Clone, Copy)]
struct Catalog {
    provider: Ulid,
    service: Ulid,
}

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid date")
}

fn date_n(n: u64) -> NaiveDate {
    base_date() + Days::new(n)
}

/// Bounds of the `i`-th slot of a day that opens at midnight.
fn slot_bounds(i: i64) -> (String, String) {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("valid time");
    let start = midnight + TimeDelta::minutes(i * SLOT_MINUTES);
    let end = start + TimeDelta::minutes(SLOT_MINUTES);
    (start.format("%H:%M").to_string(), end.format("%H:%M").to_string())
}

fn book_sql(c: Catalog, date: NaiveDate, slot: i64) -> String {
    let (start, end) = slot_bounds(slot);
    format!(
        "INSERT INTO bookings (id, provider_id, service_id, user_id, date, start_time, end_time) \
         VALUES ('{}', '{}', '{}', '{}', '{date}', '{start}', '{end}')",
        Ulid::new(),
        c.provider,
        c.service,
        Ulid::new()
    )
}

async fn setup(client: &Client) -> Catalog {
    let provider = Ulid::new();
    let service = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO providers (id, open_time, close_time, name) \
             VALUES ('{provider}', '00:00', '23:30', 'bench')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, provider_id, duration) VALUES ('{service}', '{provider}', {SLOT_MINUTES})"
        ))
        .await
        .unwrap();
    println!("  provider {provider}, service {service}");
    Catalog { provider, service }
}

async fn phase1_sequential(target: &Target, c: Catalog) {
    let client = target.connect().await;
    let slots_per_day = 47;
    let days = 40;
    let mut latencies = Vec::with_capacity(slots_per_day * days);
    let start = Instant::now();

    for d in 0..days {
        for s in 0..slots_per_day {
            let t = Instant::now();
            client
                .batch_execute(&book_sql(c, date_n(d as u64), s as i64))
                .await
                .unwrap();
            latencies.push(t.elapsed());
        }
    }

    let elapsed = start.elapsed();
    let n = latencies.len();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slot on each date. Exactly one may win.
async fn phase2_contention(target: &Target, c: Catalog) {
    let n_clients = 32;
    let rounds = 100u64;
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut clients = Vec::with_capacity(n_clients);
    for _ in 0..n_clients {
        clients.push(Arc::new(target.connect().await));
    }

    for r in 0..rounds {
        let date = date_n(1000 + r);
        let mut handles = Vec::with_capacity(n_clients);
        for client in &clients {
            let client = client.clone();
            let wins = wins.clone();
            let conflicts = conflicts.clone();
            let sql = book_sql(c, date, 20);
            handles.push(tokio::spawn(async move {
                match client.batch_execute(&sql).await {
                    Ok(()) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let code = e.as_db_error().map(|d| d.code().code().to_string());
                        if code.as_deref() == Some("23P01") {
                            conflicts.fetch_add(1, Ordering::Relaxed);
                        } else {
                            eprintln!("unexpected error: {e}");
                        }
                    }
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    let elapsed = start.elapsed();
    let wins = wins.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {rounds} rounds x {n_clients} clients in {:.2}s: {wins} wins, {conflicts} conflicts",
        elapsed.as_secs_f64()
    );
    if wins as u64 != rounds {
        println!("  !! expected exactly {rounds} wins");
    }
}

async fn phase3_read_under_load(target: &Target, c: Catalog) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4u64 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = target.connect().await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let date = date_n(5000 + w * 10_000 + i / 47);
                let _ = client.batch_execute(&book_sql(c, date, (i % 47) as i64)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = target.connect().await;
            let sql = format!(
                "SELECT * FROM slots WHERE provider_id = '{}' AND service_id = '{}' AND date = '{}'",
                c.provider,
                c.service,
                date_n(2000)
            );
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in reader_handles {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }
    print_latency("slot query", &mut all);
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("SLOTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("SLOTBOOK_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid SLOTBOOK_PORT"),
        user: std::env::var("SLOTBOOK_ADMIN_USER").unwrap_or_else(|_| "admin".into()),
        password: std::env::var("SLOTBOOK_ADMIN_PASSWORD")
            .or_else(|_| std::env::var("SLOTBOOK_PASSWORD"))
            .unwrap_or_else(|_| "slotbook".into()),
    };

    println!("=== slotbook contention benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[setup]");
    let client = target.connect().await;
    let catalog = setup(&client).await;
    drop(client);

    println!("\n[phase 1] sequential reserve throughput");
    phase1_sequential(&target, catalog).await;

    println!("\n[phase 2] same-slot contention");
    phase2_contention(&target, catalog).await;

    println!("\n[phase 3] slot query latency under write load");
    phase3_read_under_load(&target, catalog).await;

    println!("\n=== benchmark complete ===");
}
