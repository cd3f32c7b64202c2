//! Orchestration d'un chargement
//!
//! Un chargement suit les étapes existence → (bootstrap) → staging → validation
//! → swap, chaque appel distant étant attendu avant le suivant. La cible n'est
//! modifiée qu'une fois, dans la transaction de swap (sauf en mode direct).
//!
//! ```rust,ignore
//! let handle = load(pool, "Communes 2024", LoadOptions::default());
//! for feature in features {
//!     handle.send(feature).await?;
//! }
//! let report = handle.finish().await?;
//! ```

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context;
use deadpool_postgres::Pool;
use futures::FutureExt;
use geofeature::{infer_columns, resolve_table_name, Feature, Sanitizer, Validator};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::LoadError;
use crate::export::catalog::{self, Existence, DEFAULT_SRID, INTERNAL_COLUMNS};
use crate::export::cleanup::sweep_orphans;
use crate::export::staging::{create_staging, drop_staging};
use crate::export::swap::{swap, SwapPlan};
use crate::export::writer::{BatchWriter, Transport, DEFAULT_PROGRESS_INTERVAL};
use crate::export::TableRef;
use crate::report::LoadReport;
use crate::validations::{FieldMap, ValidationContext, ValidationPipeline, ValidationStep};

/// Taille de lot par défaut
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Politique de chargement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMethod {
    /// Crée la table (elle ne doit pas exister)
    #[default]
    Create,
    /// Ajoute à une table existante
    Append,
    /// Remplace le contenu d'une table existante
    Replace,
}

impl fmt::Display for LoadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Append => "append",
            Self::Replace => "replace",
        };
        f.write_str(name)
    }
}

/// Options d'un chargement
pub struct LoadOptions {
    pub method: LoadMethod,
    /// Taille des lots d'écriture, du tampon de bootstrap et du canal d'entrée
    pub batch_size: usize,
    /// Écrit directement dans la cible (append uniquement, non atomique)
    pub direct: bool,
    /// Transport COPY au lieu des INSERT multi-lignes
    pub copy: bool,
    /// Lignes entre deux événements `Inserted` (transport par lignes),
    /// jamais moins d'un lot
    pub progress_interval: u64,
    /// SRID de la colonne géométrie des tables créées
    pub srid: i32,
    /// Schéma PostgreSQL de la cible
    pub schema: String,
    /// Étapes exécutées après la réparation des géométries
    pub validations: Vec<Box<dyn ValidationStep>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            method: LoadMethod::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            direct: false,
            copy: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            srid: DEFAULT_SRID,
            schema: "public".into(),
            validations: Vec::new(),
        }
    }
}

impl fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<&str> = self.validations.iter().map(|s| s.name()).collect();
        f.debug_struct("LoadOptions")
            .field("method", &self.method)
            .field("batch_size", &self.batch_size)
            .field("direct", &self.direct)
            .field("copy", &self.copy)
            .field("progress_interval", &self.progress_interval)
            .field("srid", &self.srid)
            .field("schema", &self.schema)
            .field("validations", &steps)
            .finish()
    }
}

/// Événement émis pendant un chargement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadEvent {
    /// Lignes écrites depuis l'événement précédent
    Inserted(u64),
    /// Champ inattendu (une fois par clé) ou géométrie ignorée
    Warning(String),
    /// Chargement commité
    Uploaded,
    /// Erreur terminale
    Error(String),
}

type Completion = Result<LoadReport, LoadError>;

/// Garde de complétion : le résultat n'est livré qu'une fois
struct CompletionGuard {
    fired: AtomicBool,
    result: Mutex<Option<oneshot::Sender<Completion>>>,
    events: mpsc::UnboundedSender<LoadEvent>,
}

impl CompletionGuard {
    fn new(result: oneshot::Sender<Completion>, events: mpsc::UnboundedSender<LoadEvent>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            result: Mutex::new(Some(result)),
            events,
        }
    }

    /// Livre le résultat puis l'événement terminal ; sans effet après le premier appel
    fn complete(&self, completion: Completion) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!("Completion already delivered, ignoring");
            return false;
        }

        let event = match &completion {
            Ok(_) => LoadEvent::Uploaded,
            Err(e) => LoadEvent::Error(e.to_string()),
        };

        let sender = match self.result.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(completion);
        }
        let _ = self.events.send(event);
        true
    }
}

/// L'exécution est terminée, la feature n'a pas été prise
#[derive(Debug, Error)]
#[error("Load sink is closed")]
pub struct SinkClosed(pub Feature);

/// Entrée des features d'un chargement
#[derive(Debug, Clone)]
pub struct FeatureSink {
    tx: mpsc::Sender<Feature>,
}

impl FeatureSink {
    /// Envoie une feature ; attend tant que le canal est plein
    pub async fn send(&self, feature: Feature) -> Result<(), SinkClosed> {
        self.tx.send(feature).await.map_err(|e| SinkClosed(e.0))
    }

    /// Termine le flux d'entrée
    pub fn close(self) {}
}

/// Sortie d'un chargement : événements et résultat final
#[derive(Debug)]
pub struct LoadCompletion {
    events: mpsc::UnboundedReceiver<LoadEvent>,
    result: oneshot::Receiver<Completion>,
}

impl LoadCompletion {
    /// Prochain événement ; `None` une fois le chargement terminé et les événements lus
    pub async fn next_event(&mut self) -> Option<LoadEvent> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<LoadEvent> {
        &mut self.events
    }

    /// Attend le résultat final
    pub async fn wait(self) -> Result<LoadReport, LoadError> {
        self.result.await.map_err(|_| {
            LoadError::Transport(anyhow::anyhow!("Load task ended without a result"))
        })?
    }
}

/// Poignée d'un chargement en cours
#[derive(Debug)]
pub struct LoadHandle {
    sink: FeatureSink,
    completion: LoadCompletion,
}

impl LoadHandle {
    pub async fn send(&self, feature: Feature) -> Result<(), SinkClosed> {
        self.sink.send(feature).await
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<LoadEvent> {
        self.completion.events()
    }

    /// Ferme l'entrée et attend la fin du chargement
    pub async fn finish(self) -> Result<LoadReport, LoadError> {
        drop(self.sink);
        self.completion.wait().await
    }

    /// Sépare l'entrée et la sortie (alimentation depuis une autre tâche)
    pub fn split(self) -> (FeatureSink, LoadCompletion) {
        (self.sink, self.completion)
    }
}

/// Lance un chargement dans la table `raw_table` (nom assaini)
///
/// Doit être appelé depuis un runtime Tokio.
pub fn load(pool: Pool, raw_table: &str, mut options: LoadOptions) -> LoadHandle {
    let (feature_tx, feature_rx) = mpsc::channel(options.batch_size.max(1));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = oneshot::channel();

    let table = TableRef::new(options.schema.clone(), resolve_table_name(raw_table));
    let pipeline = ValidationPipeline::new(std::mem::take(&mut options.validations));
    info!(
        table = %table,
        method = %options.method,
        batch_size = options.batch_size,
        direct = options.direct,
        copy = options.copy,
        steps = ?pipeline.step_names(),
        "Starting load"
    );

    let guard = CompletionGuard::new(result_tx, event_tx.clone());
    let run = LoadRun {
        pool,
        table,
        options,
        pipeline,
        events: event_tx,
    };

    let task = tokio::spawn(run.execute(feature_rx));
    tokio::spawn(async move {
        let completion = match task.await {
            Ok(completion) => completion,
            Err(e) => {
                error!("Load task failed: {e}");
                Err(LoadError::Transport(anyhow::anyhow!("Load task failed: {e}")))
            }
        };
        guard.complete(completion);
    });

    LoadHandle {
        sink: FeatureSink { tx: feature_tx },
        completion: LoadCompletion {
            events: event_rx,
            result: result_rx,
        },
    }
}

/// Supprime les tables de staging orphelines d'un schéma
pub async fn cleanup_orphans(pool: &Pool, schema: &str) -> Result<usize, LoadError> {
    Ok(sweep_orphans(pool, schema).await?)
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    CheckExistence,
    Bootstrap,
    Stage,
    Validate,
    Swap,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::CheckExistence => "check_existence",
            Self::Bootstrap => "bootstrap",
            Self::Stage => "stage",
            Self::Validate => "validate",
            Self::Swap => "swap",
        }
    }
}

/// Tables créées par l'exécution, à supprimer en cas d'échec
#[derive(Debug, Default)]
struct Artifacts {
    staging: Option<TableRef>,
    created_target: Option<TableRef>,
}

impl Artifacts {
    fn is_empty(&self) -> bool {
        self.staging.is_none() && self.created_target.is_none()
    }
}

struct LoadRun {
    pool: Pool,
    table: TableRef,
    options: LoadOptions,
    pipeline: ValidationPipeline,
    events: mpsc::UnboundedSender<LoadEvent>,
}

impl LoadRun {
    async fn execute(self, mut features: mpsc::Receiver<Feature>) -> Completion {
        let started = Instant::now();
        let mut artifacts = Artifacts::default();

        // Une panique doit aussi passer par le nettoyage
        let outcome = AssertUnwindSafe(self.drive(&mut features, &mut artifacts))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(LoadError::Transport(anyhow::anyhow!(
                    "Load panicked: {}",
                    panic_message(&*payload)
                )))
            });

        match outcome {
            Ok(mut report) => {
                report.set_duration(started.elapsed());
                info!(
                    table = %self.table,
                    rows = report.rows_committed,
                    duration_secs = report.duration_secs,
                    "Load finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(table = %self.table, kind = e.kind(), "Load aborted: {e}");
                // Ferme l'entrée : les envois suivants échouent
                drop(features);
                self.discard(&artifacts).await;
                Err(e)
            }
        }
    }

    fn enter(&self, phase: Phase) {
        info!(table = %self.table, phase = phase.as_str(), "Load phase");
    }

    fn emit(&self, event: LoadEvent) {
        let _ = self.events.send(event);
    }

    async fn drive(
        &self,
        features: &mut mpsc::Receiver<Feature>,
        artifacts: &mut Artifacts,
    ) -> Result<LoadReport, LoadError> {
        let options = &self.options;
        if options.batch_size == 0 {
            return Err(LoadError::precondition("batch_size must be greater than 0"));
        }
        if options.method == LoadMethod::Replace && options.direct {
            return Err(LoadError::precondition(
                "direct mode is not permitted with the replace method",
            ));
        }

        let mut client = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;

        self.enter(Phase::CheckExistence);
        let existence = catalog::check_existence(&client, &self.table).await?;
        let existing = match (options.method, existence) {
            (LoadMethod::Create, Existence::Absent) => None,
            (LoadMethod::Create, Existence::Present(_)) => {
                return Err(LoadError::precondition(format!(
                    "table {} already exists",
                    self.table
                )))
            }
            (_, Existence::Absent) => {
                return Err(LoadError::precondition(format!(
                    "table {} does not exist",
                    self.table
                )))
            }
            (_, Existence::Present(schema)) => Some(schema),
        };

        let mut sanitizer = Sanitizer::new();
        let mut buffered = Vec::new();

        let schema = match existing {
            Some(schema) => schema,
            None => {
                self.enter(Phase::Bootstrap);
                buffered.reserve(options.batch_size);
                while buffered.len() < options.batch_size {
                    match features.recv().await {
                        Some(feature) => buffered.push(sanitizer.sanitize_feature(feature)),
                        None => break,
                    }
                }

                let columns = infer_columns(&buffered, INTERNAL_COLUMNS);
                debug!(table = %self.table, sample = buffered.len(), columns = ?columns, "Inferred columns");
                catalog::bootstrap_table(&client, &self.table, &columns, options.srid).await?;
                artifacts.created_target = Some(self.table.clone());
                catalog::fetch_schema(&client, &self.table).await?
            }
        };

        let direct = options.direct && options.method == LoadMethod::Append;
        if options.direct && !direct {
            warn!(table = %self.table, method = %options.method, "Direct mode only applies to append, staging anyway");
        }

        self.enter(Phase::Stage);
        let staging = if direct {
            info!(table = %self.table, "Direct mode: writing into the target without staging");
            None
        } else {
            let staging = create_staging(&client, &self.table).await?;
            artifacts.staging = Some(staging.clone());
            Some(staging)
        };

        let mut report = LoadReport::new(self.table.to_string(), options.method);
        report.staging = staging.as_ref().map(|s| s.to_string());

        let destination = staging.clone().unwrap_or_else(|| self.table.clone());
        let transport = if options.copy {
            Transport::Copy
        } else {
            Transport::Rows
        };

        let mut validator = Validator::new(schema.clone());
        let mut writer = BatchWriter::new(
            &client,
            destination,
            schema.clone(),
            options.batch_size,
            transport,
            options.progress_interval,
        );

        for feature in buffered {
            self.ingest(feature, &mut validator, &mut writer, &mut report)
                .await?;
        }
        while let Some(feature) = features.recv().await {
            let feature = sanitizer.sanitize_feature(feature);
            self.ingest(feature, &mut validator, &mut writer, &mut report)
                .await?;
        }

        let summary = writer.finish().await?;
        if let Some(delta) = summary.progress {
            self.emit(LoadEvent::Inserted(delta));
        }

        let stats = validator.stats();
        report.rows_received = stats.received;
        report.rows_dropped = stats.dropped;
        report.rows_written = summary.written;
        debug!(
            table = %self.table,
            received = stats.received,
            dropped = stats.dropped,
            rejected_values = stats.rejected_values,
            written = summary.written,
            "Stream consumed"
        );

        let Some(staging) = staging else {
            report.rows_committed = summary.written;
            return Ok(report);
        };

        self.enter(Phase::Validate);
        let ctx = ValidationContext::new(FieldMap::identity(schema.names()), schema.has_geometry());
        let ctx = self.pipeline.run(&staging, ctx, &client).await?;

        self.enter(Phase::Swap);
        let plan = SwapPlan::build(
            &staging,
            &self.table,
            &ctx.fields,
            &ctx.group,
            options.method == LoadMethod::Replace,
        );
        report.rows_committed = swap(&mut client, &self.table, &staging, &plan).await?;
        *artifacts = Artifacts::default();

        Ok(report)
    }

    async fn ingest(
        &self,
        feature: Feature,
        validator: &mut Validator,
        writer: &mut BatchWriter<'_>,
        report: &mut LoadReport,
    ) -> Result<(), LoadError> {
        let record = validator.validate(feature);

        for warning in validator.drain_warnings() {
            self.emit(LoadEvent::Warning(warning.clone()));
            report.warnings.push(warning);
        }

        if let Some(record) = record {
            if let Some(delta) = writer.write(record).await? {
                self.emit(LoadEvent::Inserted(delta));
            }
        }
        Ok(())
    }

    /// Suppression best-effort des tables créées ; n'altère jamais l'erreur d'origine
    async fn discard(&self, artifacts: &Artifacts) {
        if artifacts.is_empty() {
            return;
        }

        let client = match self.pool.get().await {
            Ok(client) => client,
            Err(e) => {
                warn!(table = %self.table, "Cannot clean up after failed load: {e}");
                return;
            }
        };

        if let Some(staging) = &artifacts.staging {
            match drop_staging(&client, staging).await {
                Ok(()) => debug!(staging = %staging, "Dropped staging table"),
                Err(e) => warn!(staging = %staging, "Failed to drop staging table: {e:#}"),
            }
        }

        if let Some(target) = &artifacts.created_target {
            match catalog::drop_table(&client, target).await {
                Ok(()) => info!(table = %target, "Dropped table created by the failed load"),
                Err(e) => warn!(table = %target, "Failed to drop created table: {e:#}"),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::pool::{create_pool, ConnectionParams};
    use crate::validations::MinRows;

    fn guard() -> (
        CompletionGuard,
        oneshot::Receiver<Completion>,
        mpsc::UnboundedReceiver<LoadEvent>,
    ) {
        let (result_tx, result_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (CompletionGuard::new(result_tx, event_tx), result_rx, event_rx)
    }

    #[test]
    fn test_method_display_and_serde() {
        assert_eq!(LoadMethod::Replace.to_string(), "replace");
        assert_eq!(
            serde_json::from_str::<LoadMethod>("\"append\"").unwrap(),
            LoadMethod::Append
        );
        assert!(serde_json::from_str::<LoadMethod>("\"upsert\"").is_err());
    }

    #[test]
    fn test_default_options() {
        let options = LoadOptions::default();
        assert_eq!(options.method, LoadMethod::Create);
        assert_eq!(options.batch_size, 200);
        assert_eq!(options.progress_interval, 100);
        assert_eq!(options.srid, 4326);
        assert!(!options.direct && !options.copy);
    }

    #[test]
    fn test_options_debug_lists_steps() {
        let options = LoadOptions {
            validations: vec![Box::new(MinRows { count: 1 })],
            ..LoadOptions::default()
        };
        assert!(format!("{:?}", options).contains("[\"min_rows\"]"));
    }

    #[test]
    fn test_completion_fires_once() {
        let (guard, mut result_rx, mut event_rx) = guard();

        assert!(guard.complete(Err(LoadError::precondition("first"))));
        assert!(!guard.complete(Ok(LoadReport::new("public.t", LoadMethod::Create))));

        match result_rx.try_recv().unwrap() {
            Err(LoadError::Precondition(message)) => assert_eq!(message, "first"),
            other => panic!("unexpected completion: {other:?}"),
        }
        assert_eq!(
            event_rx.try_recv().unwrap(),
            LoadEvent::Error("Precondition failed: first".into())
        );
        assert!(event_rx.try_recv().is_err());
    }

    #[test]
    fn test_success_emits_uploaded() {
        let (guard, mut result_rx, mut event_rx) = guard();
        guard.complete(Ok(LoadReport::new("public.t", LoadMethod::Append)));

        assert!(result_rx.try_recv().unwrap().is_ok());
        assert_eq!(event_rx.try_recv().unwrap(), LoadEvent::Uploaded);
    }

    #[tokio::test]
    async fn test_replace_direct_rejected_without_io() {
        // Le pool ne se connecte qu'au premier `get`
        let pool = create_pool(&ConnectionParams::default()).unwrap();
        let options = LoadOptions {
            method: LoadMethod::Replace,
            direct: true,
            ..LoadOptions::default()
        };

        let handle = load(pool, "Communes", options);
        let (sink, mut completion) = handle.split();

        match completion.next_event().await {
            Some(LoadEvent::Error(message)) => assert!(message.starts_with("Precondition failed")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(sink.send(Feature::default()).await.is_err());
        assert!(matches!(
            completion.wait().await,
            Err(LoadError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected_without_io() {
        let pool = create_pool(&ConnectionParams::default()).unwrap();
        let options = LoadOptions {
            batch_size: 0,
            ..LoadOptions::default()
        };

        let handle = load(pool, "Communes", options);
        let (sink, mut completion) = handle.split();

        match completion.next_event().await {
            Some(LoadEvent::Error(message)) => assert!(message.contains("batch_size")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(sink.send(Feature::default()).await.is_err());
        assert!(matches!(
            completion.wait().await,
            Err(LoadError::Precondition(_))
        ));
    }

    #[test]
    fn test_panic_message() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let formatted: Box<dyn Any + Send> = Box::new(format!("step {} failed", 2));
        let other: Box<dyn Any + Send> = Box::new(42u8);

        assert_eq!(panic_message(&*literal), "boom");
        assert_eq!(panic_message(&*formatted), "step 2 failed");
        assert_eq!(panic_message(&*other), "unknown panic payload");
    }
}
