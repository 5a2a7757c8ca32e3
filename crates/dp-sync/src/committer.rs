//! Validation and bulk insertion of converted signals.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use async_stream::stream;
use chrono::NaiveDateTime;
use dp_core::{Location, PipelineError, Signal, Step, TIMESTAMP_FORMAT};
use futures::Stream;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::db::MetadataCache;

/// Errors collected per batch before further ones are suppressed.
pub const MAX_BATCH_ERRORS: usize = 30;
/// Rows between two progress messages.
pub const PROGRESS_INTERVAL: usize = 100_000;
/// SQLite caps the bound parameters of one statement.
const ROWS_PER_STATEMENT: usize = 2_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSignal {
    pub timestamp: NaiveDateTime,
    pub value: f64,
    pub parameter_id: i64,
    pub source_id: i64,
    pub site_id: Option<i64>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LocationKey {
    Site(i64),
    Coordinates([u64; 3]),
}

type StoredKey = (NaiveDateTime, i64, i64, LocationKey);

/// Bit pattern for hashing; `-0.0` and `0.0` compare equal and must share a key.
fn canonical_bits(v: f64) -> u64 {
    if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

impl ResolvedSignal {
    fn key(&self) -> StoredKey {
        let location = match self.site_id {
            Some(id) => LocationKey::Site(id),
            None => LocationKey::Coordinates([
                canonical_bits(self.x),
                canonical_bits(self.y),
                canonical_bits(self.z),
            ]),
        };
        (self.timestamp, self.source_id, self.parameter_id, location)
    }
}

#[derive(Debug, Default)]
pub struct Validation {
    pub rows: Vec<ResolvedSignal>,
    pub errors: Vec<PipelineError>,
    /// Rows dropped because the database already holds them with the same value.
    pub already_present: usize,
}

impl Validation {
    fn push_error(&mut self, error: PipelineError) {
        if self.errors.len() < MAX_BATCH_ERRORS {
            self.errors.push(error);
        } else if self.errors.len() == MAX_BATCH_ERRORS {
            self.errors.push(PipelineError::new(
                error.kind,
                format!("more than {MAX_BATCH_ERRORS} errors, further ones suppressed"),
            ));
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub already_present: usize,
}

fn describe(signal: &Signal) -> String {
    let location = match &signal.location {
        Location::Site(site) => format!("site {site}"),
        Location::Coordinates { x, y, z } => format!("({x}, {y}, {z})"),
    };
    format!(
        "{} {} {} at {location}",
        signal.timestamp.format(TIMESTAMP_FORMAT),
        signal.source,
        signal.parameter
    )
}

/// Validates and commits one batch; metadata is cached on first use.
pub struct SignalCommitter {
    pool: SqlitePool,
    cache: Option<MetadataCache>,
}

impl SignalCommitter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, cache: None }
    }

    async fn cache(&mut self) -> Result<&MetadataCache> {
        if self.cache.is_none() {
            self.cache = Some(MetadataCache::load(&self.pool).await?);
        }
        self.cache
            .as_ref()
            .context("metadata cache missing after load")
    }

    pub async fn validate(&mut self, signals: Vec<Signal>) -> Result<Validation> {
        let mut validation = Validation::default();
        let sane = field_sanity(signals, &mut validation);
        let cache = self.cache().await?.clone();
        let resolved = resolve(sane, &cache, &mut validation);
        check_batch_duplicates(&resolved, &mut validation);
        let fresh = self.drop_stored(resolved, &mut validation).await?;
        validation.rows = fresh;
        Ok(validation)
    }

    async fn drop_stored(
        &self,
        rows: Vec<(Signal, ResolvedSignal)>,
        validation: &mut Validation,
    ) -> Result<Vec<ResolvedSignal>> {
        let (Some(min), Some(max)) = (
            rows.iter().map(|(_, r)| r.timestamp).min(),
            rows.iter().map(|(_, r)| r.timestamp).max(),
        ) else {
            return Ok(Vec::new());
        };
        let source_ids: BTreeSet<i64> = rows.iter().map(|(_, r)| r.source_id).collect();

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT timestamp, value, source_id, parameter_id, site_id, coord_x, coord_y, coord_z \
             FROM signal WHERE timestamp >= ",
        );
        query.push_bind(min);
        query.push(" AND timestamp <= ");
        query.push_bind(max);
        query.push(" AND source_id IN (");
        let mut separated = query.separated(", ");
        for id in &source_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let mut stored: HashMap<StoredKey, f64> = HashMap::new();
        for row in query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("querying stored signals")?
        {
            let site_id: Option<i64> = row.try_get("site_id")?;
            let location = match site_id {
                Some(id) => LocationKey::Site(id),
                None => {
                    let x: Option<f64> = row.try_get("coord_x")?;
                    let y: Option<f64> = row.try_get("coord_y")?;
                    let z: Option<f64> = row.try_get("coord_z")?;
                    LocationKey::Coordinates([
                        canonical_bits(x.unwrap_or_default()),
                        canonical_bits(y.unwrap_or_default()),
                        canonical_bits(z.unwrap_or_default()),
                    ])
                }
            };
            let key = (
                row.try_get("timestamp")?,
                row.try_get("source_id")?,
                row.try_get("parameter_id")?,
                location,
            );
            stored.insert(key, row.try_get("value")?);
        }
        debug!(candidates = stored.len(), "stored signals in batch range");

        let mut fresh = Vec::with_capacity(rows.len());
        for (signal, row) in rows {
            match stored.get(&row.key()) {
                None => fresh.push(row),
                Some(value) if *value == row.value => validation.already_present += 1,
                Some(value) => validation.push_error(PipelineError::consistency(format!(
                    "{} has value {} but the database holds {value}",
                    describe(&signal),
                    row.value
                ))),
            }
        }
        Ok(fresh)
    }

    /// Validate, then insert everything in one transaction; any error aborts the batch.
    pub fn commit(&mut self, signals: Vec<Signal>) -> impl Stream<Item = Step<CommitSummary>> + '_ {
        stream! {
            let total = signals.len();
            let validation = match self.validate(signals).await {
                Ok(validation) => validation,
                Err(err) => {
                    yield Step::Failure(PipelineError::io(format!("{err:#}")));
                    return;
                }
            };
            if !validation.errors.is_empty() {
                for error in validation.errors {
                    yield Step::Failure(error);
                }
                return;
            }
            yield Step::progress(format!(
                "{} of {total} signals are new, {} already stored",
                validation.rows.len(),
                validation.already_present
            ));

            let rows = validation.rows;
            let mut tx = match self.pool.begin().await {
                Ok(tx) => tx,
                Err(err) => {
                    yield Step::Failure(PipelineError::io(format!("cannot open transaction: {err}")));
                    return;
                }
            };
            let mut inserted = 0usize;
            for chunk in rows.chunks(ROWS_PER_STATEMENT) {
                let mut insert: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "INSERT INTO signal (value, timestamp, parameter_id, source_id, site_id, coord_x, coord_y, coord_z) ",
                );
                insert.push_values(chunk, |mut b, row| {
                    b.push_bind(row.value)
                        .push_bind(row.timestamp)
                        .push_bind(row.parameter_id)
                        .push_bind(row.source_id)
                        .push_bind(row.site_id)
                        .push_bind(row.x)
                        .push_bind(row.y)
                        .push_bind(row.z);
                });
                if let Err(err) = insert.build().execute(&mut *tx).await {
                    yield Step::Failure(PipelineError::io(format!("inserting signals failed: {err}")));
                    return;
                }
                let before = inserted;
                inserted += chunk.len();
                if inserted / PROGRESS_INTERVAL > before / PROGRESS_INTERVAL {
                    yield Step::progress(format!("inserted {inserted} of {} signals", rows.len()));
                }
            }
            if let Err(err) = tx.commit().await {
                yield Step::Failure(PipelineError::io(format!("commit failed: {err}")));
                return;
            }
            info!(inserted, already_present = validation.already_present, "signals committed");
            yield Step::Done(CommitSummary {
                inserted,
                already_present: validation.already_present,
            });
        }
    }
}

fn field_sanity(signals: Vec<Signal>, validation: &mut Validation) -> Vec<Signal> {
    let mut sane = Vec::with_capacity(signals.len());
    for signal in signals {
        let mut problems = Vec::new();
        if !signal.value.is_finite() {
            problems.push("value is not a finite number");
        }
        if signal.parameter.trim().is_empty() {
            problems.push("parameter is empty");
        }
        if signal.source.trim().is_empty() {
            problems.push("source is empty");
        }
        match &signal.location {
            Location::Site(site) if site.trim().is_empty() => problems.push("site is empty"),
            Location::Coordinates { x, y, z } if !(x.is_finite() && y.is_finite() && z.is_finite()) => {
                problems.push("coordinates are not finite numbers")
            }
            _ => {}
        }
        if problems.is_empty() {
            sane.push(signal);
        } else {
            validation.push_error(PipelineError::format(format!(
                "{}: {}",
                describe(&signal),
                problems.join(", ")
            )));
        }
    }
    sane
}

fn resolve(
    signals: Vec<Signal>,
    cache: &MetadataCache,
    validation: &mut Validation,
) -> Vec<(Signal, ResolvedSignal)> {
    let mut reported: HashSet<(&'static str, String)> = HashSet::new();
    let mut missing = |what: &'static str, name: &str, validation: &mut Validation| {
        if reported.insert((what, name.to_string())) {
            validation.push_error(PipelineError::consistency(format!("{what} {name} does not exist")));
        }
    };

    let mut resolved = Vec::with_capacity(signals.len());
    for signal in signals {
        let source_id = cache.sources.get(&signal.source).copied();
        let parameter_id = cache.parameters.get(&signal.parameter).copied();
        if source_id.is_none() {
            missing("source", &signal.source, validation);
        }
        if parameter_id.is_none() {
            missing("parameter", &signal.parameter, validation);
        }
        let place = match &signal.location {
            Location::Site(name) => match cache.sites.get(name) {
                Some(site) => Some((
                    Some(site.site_id),
                    site.coordinates.x,
                    site.coordinates.y,
                    site.coordinates.z,
                )),
                None => {
                    missing("site", name, validation);
                    None
                }
            },
            Location::Coordinates { x, y, z } => Some((None, *x, *y, *z)),
        };
        if let (Some(source_id), Some(parameter_id), Some((site_id, x, y, z))) =
            (source_id, parameter_id, place)
        {
            let row = ResolvedSignal {
                timestamp: signal.timestamp,
                value: signal.value,
                parameter_id,
                source_id,
                site_id,
                x,
                y,
                z,
            };
            resolved.push((signal, row));
        }
    }
    resolved
}

fn check_batch_duplicates(rows: &[(Signal, ResolvedSignal)], validation: &mut Validation) {
    let mut tally: HashMap<(StoredKey, u64), usize> = HashMap::new();
    let mut values: HashMap<StoredKey, f64> = HashMap::new();
    let mut conflicting: HashSet<StoredKey> = HashSet::new();
    for (_, row) in rows {
        let key = row.key();
        *tally.entry((key, canonical_bits(row.value))).or_default() += 1;
        match values.get(&key) {
            Some(seen) if *seen != row.value => {
                conflicting.insert(key);
            }
            Some(_) => {}
            None => {
                values.insert(key, row.value);
            }
        }
    }

    let mut reported: HashSet<StoredKey> = HashSet::new();
    for (signal, row) in rows {
        let key = row.key();
        if conflicting.contains(&key) {
            if reported.insert(key) {
                validation.push_error(PipelineError::consistency(format!(
                    "{} appears with different values in this batch",
                    describe(signal)
                )));
            }
        } else if tally[&(key, canonical_bits(row.value))] > 1 && reported.insert(key) {
            validation.push_error(PipelineError::consistency(format!(
                "duplicate signal {} = {} appears {} times in this batch",
                describe(signal),
                row.value,
                tally[&(key, canonical_bits(row.value))]
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_signals, tests::migrated_pool};
    use dp_core::ErrorKind;
    use futures::{pin_mut, StreamExt};

    async fn seed(pool: &SqlitePool) {
        for sql in [
            "INSERT INTO site (name, coord_x, coord_y, coord_z) VALUES ('lake', 10, 20, 30)",
            "INSERT INTO parameter (name, unit) VALUES ('temp', 'degC')",
            "INSERT INTO source_type (name) VALUES ('acme')",
            "INSERT INTO source (name, source_type_id) VALUES ('sensor-1', 1)",
        ] {
            sqlx::query(sql).execute(pool).await.expect("seed");
        }
    }

    fn signal(minute: u32, value: f64) -> Signal {
        Signal {
            timestamp: NaiveDateTime::parse_from_str(
                &format!("2020-01-01 00:{minute:02}:00"),
                TIMESTAMP_FORMAT,
            )
            .expect("timestamp"),
            parameter: "temp".to_string(),
            source: "sensor-1".to_string(),
            value,
            location: Location::Site("lake".to_string()),
        }
    }

    async fn run(pool: &SqlitePool, signals: Vec<Signal>) -> Vec<Step<CommitSummary>> {
        let mut committer = SignalCommitter::new(pool.clone());
        let steps = committer.commit(signals);
        pin_mut!(steps);
        let mut out = Vec::new();
        while let Some(step) = steps.next().await {
            out.push(step);
        }
        out
    }

    fn failures(steps: &[Step<CommitSummary>]) -> Vec<PipelineError> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::Failure(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn committing_twice_inserts_once() {
        let pool = migrated_pool().await;
        seed(&pool).await;
        let batch = vec![signal(0, 23.5), signal(1, 23.6)];

        let first = run(&pool, batch.clone()).await;
        assert!(matches!(
            first.last(),
            Some(Step::Done(CommitSummary { inserted: 2, already_present: 0 }))
        ));
        let second = run(&pool, batch).await;
        assert!(failures(&second).is_empty());
        assert!(matches!(
            second.last(),
            Some(Step::Done(CommitSummary { inserted: 0, already_present: 2 }))
        ));
        assert_eq!(count_signals(&pool).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn named_site_rows_store_site_coordinates() {
        let pool = migrated_pool().await;
        seed(&pool).await;
        run(&pool, vec![signal(0, 1.0)]).await;
        let row = sqlx::query("SELECT site_id, coord_x, coord_z FROM signal")
            .fetch_one(&pool)
            .await
            .expect("row");
        assert_eq!(row.try_get::<Option<i64>, _>("site_id").expect("site"), Some(1));
        assert_eq!(row.try_get::<f64, _>("coord_x").expect("x"), 10.0);
        assert_eq!(row.try_get::<f64, _>("coord_z").expect("z"), 30.0);
    }

    #[tokio::test]
    async fn differing_stored_value_is_a_consistency_error() {
        let pool = migrated_pool().await;
        seed(&pool).await;
        run(&pool, vec![signal(0, 1.0)]).await;
        let steps = run(&pool, vec![signal(0, 2.0), signal(1, 3.0)]).await;
        let errors = failures(&steps);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Consistency);
        assert!(!steps.iter().any(|s| matches!(s, Step::Done(_))));
        assert_eq!(count_signals(&pool).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn duplicate_within_batch_aborts_commit() {
        let pool = migrated_pool().await;
        seed(&pool).await;
        let steps = run(&pool, vec![signal(0, 23.5), signal(0, 23.5)]).await;
        let errors = failures(&steps);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("duplicate"));
        assert_eq!(count_signals(&pool).await.expect("count"), 0);
    }

    fn at_coordinates(signal: Signal, x: f64) -> Signal {
        Signal {
            location: Location::Coordinates { x, y: 1.0, z: 2.0 },
            ..signal
        }
    }

    #[tokio::test]
    async fn negative_zero_coordinate_is_the_same_location() {
        let pool = migrated_pool().await;
        seed(&pool).await;
        let steps = run(
            &pool,
            vec![
                at_coordinates(signal(0, 5.0), 0.0),
                at_coordinates(signal(0, 5.0), -0.0),
            ],
        )
        .await;
        let errors = failures(&steps);
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].message.contains("duplicate"));

        run(&pool, vec![at_coordinates(signal(1, 5.0), 0.0)]).await;
        let again = run(&pool, vec![at_coordinates(signal(1, 5.0), -0.0)]).await;
        assert!(failures(&again).is_empty());
        assert!(matches!(
            again.last(),
            Some(Step::Done(CommitSummary { inserted: 0, already_present: 1 }))
        ));
        assert_eq!(count_signals(&pool).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn unknown_names_are_reported_once() {
        let pool = migrated_pool().await;
        seed(&pool).await;
        let mut a = signal(0, 1.0);
        a.source = "ghost".to_string();
        let mut b = signal(1, 1.0);
        b.source = "ghost".to_string();
        let mut c = signal(2, 1.0);
        c.location = Location::Site("nowhere".to_string());
        let steps = run(&pool, vec![a, b, c]).await;
        let errors = failures(&steps);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Consistency));
    }

    #[tokio::test]
    async fn single_timestamp_batch_commits() {
        let pool = migrated_pool().await;
        seed(&pool).await;
        let mut other = signal(0, 5.0);
        other.location = Location::Coordinates { x: 1.0, y: 2.0, z: 3.0 };
        let steps = run(&pool, vec![signal(0, 4.0), other]).await;
        assert!(failures(&steps).is_empty());
        assert_eq!(count_signals(&pool).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn error_list_is_capped() {
        let pool = migrated_pool().await;
        seed(&pool).await;
        let batch = (0..50)
            .map(|i| {
                let mut s = signal(i % 60, 1.0);
                s.parameter = format!("p{i}");
                s
            })
            .collect();
        let steps = run(&pool, batch).await;
        assert_eq!(failures(&steps).len(), MAX_BATCH_ERRORS + 1);
    }
}
