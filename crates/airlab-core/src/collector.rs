//! Single-shot collection pipeline.
//!
//! One run is: episode, empty check, range validation, durable write. The
//! store is opened before the bus is touched so a broken database fails fast.

use std::future::Future;

use tracing::{error, info, warn};

use crate::bus::BusClient;
use crate::config::Config;
use crate::episode::{EpisodeConfig, EpisodeController, EpisodePhase};
use crate::error::{Error, Result};
use crate::mqtt::MqttBus;
use crate::normalize::Normalizer;
use crate::reading::Reading;
use crate::storage::{ReadingStore, StoredRecord};
use crate::validate::validate_reading;

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct CollectReport {
    pub reading: Reading,
    pub record: StoredRecord,
    /// Write attempts, including the successful one.
    pub attempts: u32,
    pub phase: EpisodePhase,
    pub accepted_messages: u32,
}

/// Open the store described by `config`.
pub fn open_store(config: &Config) -> Result<ReadingStore> {
    ReadingStore::open(
        &config.storage.db_path,
        config.storage.busy_timeout(),
        config.storage.retry_policy(),
    )
}

/// Run one episode on an already connected bus and persist the result.
pub async fn run_single<B, S>(
    config: &Config,
    bus: &mut B,
    store: &ReadingStore,
    shutdown: S,
) -> Result<CollectReport>
where
    B: BusClient + ?Sized,
    S: Future<Output = ()> + Send,
{
    let normalizer = Normalizer::new(&config.bus.base_topic, &config.collect.discovery_suffix);
    let mut controller = EpisodeController::new(EpisodeConfig::from_config(config), normalizer);
    let episode = controller.run(bus, shutdown).await?;

    if episode.reading.is_empty() {
        error!("Empty reading");
        return Err(Error::EmptyReading);
    }

    if let Err(report) = validate_reading(&episode.reading) {
        warn!(violations = report.violations.len(), "Reading failed validation, not saved");
        return Err(Error::Validation(report));
    }

    let receipt = store.insert_async(episode.reading.clone()).await?;
    info!(
        record_id = receipt.record.id,
        accepted_messages = episode.accepted_messages,
        ignored_messages = episode.ignored_messages,
        elapsed_ms = episode.elapsed.as_millis() as u64,
        "Episode complete"
    );

    Ok(CollectReport {
        reading: episode.reading,
        record: receipt.record,
        attempts: receipt.attempts,
        phase: episode.phase,
        accepted_messages: episode.accepted_messages,
    })
}

/// Open storage, connect to the broker and run one episode.
pub async fn collect_once<S>(config: &Config, shutdown: S) -> Result<CollectReport>
where
    S: Future<Output = ()> + Send,
{
    let store = open_store(config)?;
    let mut bus = MqttBus::connect(&config.bus).await?;
    run_single(config, &mut bus, &store, shutdown).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::LoopbackBus;
    use crate::metric::CanonicalMetric;
    use crate::storage::open_database;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("data").join("airlab.db");
        config
    }

    fn store_for(config: &Config) -> ReadingStore {
        let conn = open_database(&config.storage.db_path, Duration::from_millis(100)).unwrap();
        ReadingStore::from_connection(conn, config.storage.retry_policy())
    }

    #[tokio::test(start_paused = true)]
    async fn valid_episode_is_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = store_for(&config);
        let (mut bus, publisher) = LoopbackBus::new();
        publisher
            .publish(
                "airlab/state",
                r#"{"co2": 800, "temperature": 21.5, "humidity": 40}"#,
            )
            .await
            .unwrap();

        let report = run_single(&config, &mut bus, &store, std::future::pending())
            .await
            .unwrap();

        assert_eq!(report.phase, EpisodePhase::Completed);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.reading.len(), 3);
        assert_eq!(store.count().unwrap(), 1);
        let latest = store.latest(1).unwrap();
        assert_eq!(latest[0].reading.get(CanonicalMetric::Co2Ppm), Some(800.0));
        assert_eq!(latest[0].reading.get(CanonicalMetric::PressureHpa), None);
        assert_eq!(publisher.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_reading_is_not_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = store_for(&config);
        let (mut bus, publisher) = LoopbackBus::new();
        publisher
            .publish("airlab/state", r#"{"co2": 50000, "temperature": 21.0}"#)
            .await
            .unwrap();

        let err = run_single(&config, &mut bus, &store, std::future::pending())
            .await
            .unwrap_err();

        match &err {
            Error::Validation(report) => {
                assert_eq!(report.violations.len(), 1);
                assert_eq!(report.violations[0].metric, CanonicalMetric::Co2Ppm);
            }
            other => panic!("expected validation error, got {other}"),
        }
        assert_eq!(err.exit_code(), 2);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_no_data_and_nothing_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = store_for(&config);
        let (mut bus, publisher) = LoopbackBus::new();
        publisher.publish("airlab/status", "online").await.unwrap();

        let err = run_single(&config, &mut bus, &store, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoData { .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(publisher.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = store_for(&config);
        let (mut bus, publisher) = LoopbackBus::new();
        publisher.publish("airlab/co2", "640").await.unwrap();

        let shutdown = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        };
        let err = run_single(&config, &mut bus, &store, shutdown)
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 130);
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(publisher.disconnect_count(), 1);
    }

    #[test]
    fn open_store_creates_database_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = open_store(&config).unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(config.storage.db_path.exists());
    }
}
