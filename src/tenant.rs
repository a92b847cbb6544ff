use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::config::BookingPolicy;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::{self, NotifyHub};

/// Per-tenant engines, keyed by the database name of the connection.
/// Each tenant owns its WAL, a compactor task and a notification relay.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: BookingPolicy,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, policy: BookingPolicy) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
        }
    }

    /// Get or lazily create the engine for a tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if tenant.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        // The name is also the WAL file stem; two names must never share one file.
        if sanitize(tenant) != tenant {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid tenant name {tenant:?}: use letters, digits, '_' or '-'"),
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Holding the entry keeps two first connections from opening the same WAL twice.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{tenant}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify.clone(), self.policy)?);

                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                tokio::spawn(notify::run_relay(tenant.to_string(), notify.subscribe()));

                slot.insert(engine.clone());
                engine
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!("tenant {tenant} loaded");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorslot_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, BookingPolicy::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("school_a").unwrap();
        let eng_b = tm.get_or_create("school_b").unwrap();

        let tutor = Ulid::new();
        let window = AvailabilityWindow {
            id: Ulid::new(),
            tutor_id: tutor,
            recurrence: Recurrence::Once { date: NaiveDate::from_ymd_opt(2090, 6, 1).unwrap() },
            start: TimeOfDay::hm(9, 0).unwrap(),
            end: TimeOfDay::hm(12, 0).unwrap(),
        };
        eng_a.add_window(&Actor::tutor(tutor), window).await.unwrap();

        assert_eq!(eng_a.list_windows(tutor).await.len(), 1);
        assert!(eng_b.list_windows(tutor).await.is_empty());

        let date = NaiveDate::from_ymd_opt(2090, 6, 1).unwrap();
        let slots_b = eng_b.available_slots(tutor, date, None, None).await.unwrap();
        assert!(slots_b.is_empty());
        let slots_a = eng_a.available_slots(tutor, date, None, None).await.unwrap();
        assert!(!slots_a.is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn unsafe_tenant_names_rejected() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        assert!(tm.get_or_create("../evil").is_err());
        assert!(tm.get_or_create("../..").is_err());
        assert!(tm.get_or_create("").is_err());
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
        assert_eq!(tm.tenant_count(), 0);
    }

    #[tokio::test]
    async fn lookalike_names_cannot_share_a_wal() {
        let dir = test_data_dir("lookalike");
        let tm = manager(dir.clone());

        let err = tm.get_or_create("school.a").err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        let tutor = Ulid::new();
        let student = Ulid::new();
        let date = NaiveDate::from_ymd_opt(2090, 6, 1).unwrap();
        let eng = tm.get_or_create("schoola").unwrap();
        eng.add_window(
            &Actor::tutor(tutor),
            AvailabilityWindow {
                id: Ulid::new(),
                tutor_id: tutor,
                recurrence: Recurrence::Once { date },
                start: TimeOfDay::hm(9, 0).unwrap(),
                end: TimeOfDay::hm(12, 0).unwrap(),
            },
        )
        .await
        .unwrap();
        eng.purchase_hours(&Actor::admin(), BalanceKey::new(student, None), 120)
            .await
            .unwrap();
        let start = day_start_ms(date) + 10 * MS_PER_HOUR;
        let span = Span::new(start, start + MS_PER_HOUR);
        let book = |id| crate::engine::BookingRequest {
            id,
            student_id: student,
            tutor_id: tutor,
            span,
            course_id: None,
            notes: None,
        };
        eng.book(&Actor::student(student), book(Ulid::new())).await.unwrap();
        assert!(eng.book(&Actor::student(student), book(Ulid::new())).await.is_err());

        drop(eng);
        let reloaded = manager(dir).get_or_create("schoola").unwrap();
        let booked = reloaded.list_by_tutor(&Actor::admin(), tutor, None).await.unwrap();
        assert_eq!(booked.len(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn balances_survive_reload() {
        let dir = test_data_dir("reload");
        let student = Ulid::new();
        let key = BalanceKey::new(student, None);
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("academy").unwrap();
            eng.purchase_hours(&Actor::admin(), key.clone(), 240).await.unwrap();
        }

        let tm = manager(dir);
        let eng = tm.get_or_create("academy").unwrap();
        let balance = eng.balance(&Actor::student(student), &key).await.unwrap();
        assert_eq!(balance.available(), 240);
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
