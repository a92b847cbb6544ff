use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use tutorslot::config::BookingPolicy;
use tutorslot::tenant::TenantManager;
use tutorslot::wire;

const PASSWORD: &str = "tutorslot";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tutorslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, BookingPolicy::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn try_connect(addr: SocketAddr, db: &str, user: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, db: &str, user: &str) -> Client {
    try_connect(addr, db, user).await.unwrap()
}

/// Three clients on one tenant: a tutor, a student and an admin.
struct School {
    tutor_id: Ulid,
    student_id: Ulid,
    tutor: Client,
    student: Client,
    admin: Client,
}

async fn school(addr: SocketAddr, db: &str) -> School {
    let tutor_id = Ulid::new();
    let student_id = Ulid::new();
    School {
        tutor_id,
        student_id,
        tutor: connect(addr, db, &format!("tutor:{tutor_id}")).await,
        student: connect(addr, db, &format!("student:{student_id}")).await,
        admin: connect(addr, db, "admin").await,
    }
}

fn upcoming_monday() -> NaiveDate {
    let mut date = Utc::now().date_naive() + Duration::days(8);
    while date.weekday() != Weekday::Mon {
        date = date.succ_opt().unwrap();
    }
    date
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> i64 {
    date.and_hms_opt(hour, minute, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate_of(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn open_monday(s: &School) {
    s.tutor
        .batch_execute(&format!(
            "INSERT INTO availability_windows (id, tutor_id, day_of_week, start_time, end_time) \
             VALUES ('{}', '{}', 1, '09:00', '12:00')",
            Ulid::new(),
            s.tutor_id
        ))
        .await
        .unwrap();
}

async fn fund(s: &School, minutes: i64) {
    s.admin
        .batch_execute(&format!(
            "INSERT INTO purchases (student_id, minutes) VALUES ('{}', {minutes})",
            s.student_id
        ))
        .await
        .unwrap();
}

fn slots_sql(s: &School, date: NaiveDate) -> String {
    format!(
        "SELECT * FROM available_slots WHERE tutor_id = '{}' AND slot_date = '{date}'",
        s.tutor_id
    )
}

fn book_sql(s: &School, id: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO appointments (id, student_id, tutor_id, start, "end") VALUES ('{id}', '{}', '{}', {start}, {end})"#,
        s.student_id, s.tutor_id
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_cancel_over_the_wire() {
    let addr = start_test_server().await;
    let s = school(addr, "academy").await;
    let monday = upcoming_monday();
    open_monday(&s).await;
    fund(&s, 120).await;

    let before = rows(&s.student, &slots_sql(&s, monday)).await;
    assert_eq!(before.len(), 5, "09:00..11:00 every 30 minutes");
    assert_eq!(before[0].get("start"), Some(at(monday, 9, 0).to_string().as_str()));

    let appt = Ulid::new();
    s.student
        .batch_execute(&book_sql(&s, appt, at(monday, 10, 0), at(monday, 11, 0)))
        .await
        .unwrap();

    let after: Vec<String> = rows(&s.student, &slots_sql(&s, monday))
        .await
        .iter()
        .map(|r| r.get("start").unwrap().to_string())
        .collect();
    assert_eq!(
        after,
        vec![at(monday, 9, 0).to_string(), at(monday, 11, 0).to_string()]
    );

    let balance = rows(
        &s.student,
        &format!("SELECT * FROM balances WHERE student_id = '{}'", s.student_id),
    )
    .await;
    assert_eq!(balance.len(), 1);
    assert_eq!(balance[0].get("used"), Some("60"));
    assert_eq!(balance[0].get("available"), Some("60"));

    s.student
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{appt}'"))
        .await
        .unwrap();

    let listed = rows(
        &s.tutor,
        &format!("SELECT * FROM appointments WHERE tutor_id = '{}'", s.tutor_id),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("status"), Some("cancelled"));
    assert!(matches!(listed[0].get("credited_back"), Some("t" | "true")));

    let balance = rows(
        &s.student,
        &format!("SELECT * FROM balances WHERE student_id = '{}'", s.student_id),
    )
    .await;
    assert_eq!(balance[0].get("available"), Some("120"));
    assert_eq!(rows(&s.student, &slots_sql(&s, monday)).await.len(), 5);
}

#[tokio::test]
async fn errors_carry_sqlstates() {
    let addr = start_test_server().await;
    let s = school(addr, "errors").await;
    let monday = upcoming_monday();
    open_monday(&s).await;

    let lesson = book_sql(&s, Ulid::new(), at(monday, 9, 0), at(monday, 10, 0));
    assert_eq!(sqlstate_of(&s.student, &lesson).await, "53000");

    fund(&s, 60).await;
    s.student.batch_execute(&lesson).await.unwrap();

    let clash = book_sql(&s, Ulid::new(), at(monday, 9, 30), at(monday, 10, 30));
    assert_eq!(sqlstate_of(&s.student, &clash).await, "40001");

    let outside = book_sql(&s, Ulid::new(), at(monday, 13, 0), at(monday, 14, 0));
    assert_eq!(sqlstate_of(&s.student, &outside).await, "40001");

    let foreign_window = format!(
        "INSERT INTO availability_windows (id, tutor_id, day_of_week, start_time, end_time) \
         VALUES ('{}', '{}', 2, '09:00', '10:00')",
        Ulid::new(),
        s.tutor_id
    );
    assert_eq!(sqlstate_of(&s.student, &foreign_window).await, "42501");

    let backwards = format!(
        "INSERT INTO availability_windows (id, tutor_id, day_of_week, start_time, end_time) \
         VALUES ('{}', '{}', 2, '10:00', '09:00')",
        Ulid::new(),
        s.tutor_id
    );
    assert_eq!(sqlstate_of(&s.tutor, &backwards).await, "22023");

    assert_eq!(sqlstate_of(&s.student, "SELEC nonsense").await, "42601");
    assert_eq!(
        sqlstate_of(&s.student, &format!("DELETE FROM appointments WHERE id = '{}'", Ulid::new()))
            .await,
        "02000"
    );
}

#[tokio::test]
async fn outcome_and_reschedule_over_the_wire() {
    let addr = start_test_server().await;
    let s = school(addr, "lessons").await;
    let monday = upcoming_monday();
    open_monday(&s).await;
    fund(&s, 180).await;

    let first = Ulid::new();
    s.student
        .batch_execute(&book_sql(&s, first, at(monday, 9, 0), at(monday, 10, 0)))
        .await
        .unwrap();

    let moved = Ulid::new();
    s.student
        .batch_execute(&format!(
            r#"INSERT INTO reschedules (appointment_id, new_id, start, "end") VALUES ('{first}', '{moved}', {}, {})"#,
            at(monday, 10, 30),
            at(monday, 12, 0)
        ))
        .await
        .unwrap();

    let mine = rows(
        &s.student,
        &format!("SELECT * FROM appointments WHERE student_id = '{}'", s.student_id),
    )
    .await;
    assert_eq!(mine.len(), 2);
    assert_eq!(mine[0].get("status"), Some("cancelled"));
    assert_eq!(mine[0].get("rescheduled_to"), Some(moved.to_string().as_str()));
    assert_eq!(mine[1].get("status"), Some("scheduled"));

    let balance = rows(
        &s.student,
        &format!("SELECT * FROM balances WHERE student_id = '{}'", s.student_id),
    )
    .await;
    assert_eq!(balance[0].get("used"), Some("90"));

    // Only the tutor records outcomes.
    let outcome = format!("INSERT INTO outcomes (appointment_id, outcome) VALUES ('{moved}', 'completed')");
    assert_eq!(sqlstate_of(&s.student, &outcome).await, "42501");
    s.tutor.batch_execute(&outcome).await.unwrap();
    assert_eq!(sqlstate_of(&s.tutor, &outcome).await, "55000");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let s = school(addr, "prepared").await;
    let course = Ulid::new();

    let inserted = s
        .admin
        .execute(
            "INSERT INTO purchases (student_id, course_id, minutes) VALUES ($1, $2, $3)",
            &[&s.student_id.to_string(), &course.to_string(), &"90"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let found = s
        .student
        .query(
            "SELECT * FROM balances WHERE student_id = $1",
            &[&s.student_id.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get::<_, String>("student_id"), s.student_id.to_string());
    assert_eq!(found[0].get::<_, Option<String>>("course_id"), Some(course.to_string()));
    assert_eq!(found[0].get::<_, i64>("total_purchased"), 90);
    assert_eq!(found[0].get::<_, i64>("available"), 90);
}

#[tokio::test]
async fn window_update_and_listing() {
    let addr = start_test_server().await;
    let s = school(addr, "windows").await;
    let window = Ulid::new();
    s.tutor
        .batch_execute(&format!(
            "INSERT INTO availability_windows (id, tutor_id, day_of_week, start_time, end_time) \
             VALUES ('{window}', '{}', 3, '14:00', '16:00')",
            s.tutor_id
        ))
        .await
        .unwrap();

    s.tutor
        .batch_execute(&format!(
            "UPDATE availability_windows SET day_of_week = NULL, specific_date = '2090-05-04', \
             end_time = '18:30' WHERE id = '{window}'"
        ))
        .await
        .unwrap();

    let listed = rows(
        &s.student,
        &format!("SELECT * FROM availability_windows WHERE tutor_id = '{}'", s.tutor_id),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("day_of_week"), None);
    assert_eq!(listed[0].get("specific_date"), Some("2090-05-04"));
    assert_eq!(listed[0].get("start_time"), Some("14:00"));
    assert_eq!(listed[0].get("end_time"), Some("18:30"));

    s.tutor
        .batch_execute(&format!("DELETE FROM availability_windows WHERE id = '{window}'"))
        .await
        .unwrap();
    let listed = rows(
        &s.student,
        &format!("SELECT * FROM availability_windows WHERE tutor_id = '{}'", s.tutor_id),
    )
    .await;
    assert!(listed.is_empty());
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let addr = start_test_server().await;
    let a = school(addr, "north").await;
    open_monday(&a).await;

    let other = connect(addr, "south", &format!("student:{}", a.student_id)).await;
    let slots = rows(&other, &slots_sql(&a, upcoming_monday())).await;
    assert!(slots.is_empty());
}

#[tokio::test]
async fn unknown_user_cannot_log_in() {
    let addr = start_test_server().await;
    assert!(try_connect(addr, "academy", "parent:someone").await.is_err());
    assert!(try_connect(addr, "academy", "admin").await.is_ok());
}
