//! Feature reader stage: XML chunk -> parsed, validated, transformed feature

use super::control::RunControl;
use super::filter::FeatureFilter;
use super::transform::AffineTransformer;
use crate::citygml::{parse_chunk, XmlChunk};
use crate::concurrent::{Worker, WorkerFactory, WorkerPool};
use crate::config::ValidationConfig;
use crate::event::{EventDispatcher, InterruptKind};
use crate::model::Feature;
use crate::Result;
use std::sync::Arc;

pub struct FeatureReaderContext {
    pub content_pool: Arc<WorkerPool<Feature>>,
    pub events: Arc<EventDispatcher>,
    pub control: Arc<RunControl>,
    pub transformer: Option<AffineTransformer>,
    /// Applied to transformed features
    pub filter: FeatureFilter,
    pub validation: ValidationConfig,
    /// Input file, for messages
    pub file: String,
}

pub struct FeatureReaderWorkerFactory {
    ctx: Arc<FeatureReaderContext>,
}

impl FeatureReaderWorkerFactory {
    pub fn new(ctx: FeatureReaderContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }
}

impl WorkerFactory<XmlChunk> for FeatureReaderWorkerFactory {
    fn create_worker(&self) -> Result<Box<dyn Worker<XmlChunk>>> {
        Ok(Box::new(FeatureReaderWorker {
            ctx: Arc::clone(&self.ctx),
        }))
    }
}

pub struct FeatureReaderWorker {
    ctx: Arc<FeatureReaderContext>,
}

impl FeatureReaderWorker {
    /// Count and report validation issues. Returns `false` if the feature must not be imported.
    fn check_issues(&self, chunk: &XmlChunk, issues: &[crate::citygml::ValidationIssue]) -> bool {
        if issues.is_empty() {
            return true;
        }

        let reported = if self.ctx.validation.report_one_error_per_feature {
            &issues[..1]
        } else {
            issues
        };
        for issue in reported {
            tracing::warn!("Invalid feature {} in {}: {}", chunk.ordinal, self.ctx.file, issue);
        }
        self.ctx.control.add_validation_errors(reported.len() as u64);

        if self.ctx.validation.abort_on_error {
            self.ctx.control.interrupt(
                &self.ctx.events,
                InterruptKind::ValidationError,
                format!("Feature {} of {} is invalid: {}", chunk.ordinal, self.ctx.file, reported[0]),
                tracing::Level::WARN,
            );
        }
        false
    }
}

impl Worker<XmlChunk> for FeatureReaderWorker {
    fn do_work(&mut self, chunk: XmlChunk) {
        if self.ctx.control.is_cancelled() {
            return;
        }

        let parsed = match parse_chunk(&chunk, self.ctx.validation.enabled) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.ctx.control.interrupt(
                    &self.ctx.events,
                    InterruptKind::ParseError,
                    format!("Failed to parse feature {} of {}: {}", chunk.ordinal, self.ctx.file, e),
                    tracing::Level::ERROR,
                );
                return;
            }
        };

        if !self.check_issues(&chunk, &parsed.issues) {
            return;
        }

        let Some(mut feature) = parsed.feature else {
            tracing::trace!("Skipping member {} of {}: not a city object", chunk.ordinal, self.ctx.file);
            return;
        };

        if let Some(transformer) = &self.ctx.transformer {
            transformer.transform_feature(&mut feature);
        }

        if !self.ctx.filter.accepts(&feature) {
            tracing::trace!("Feature {} of {} does not match the import filter", chunk.ordinal, self.ctx.file);
            return;
        }

        if let Err(e) = self.ctx.content_pool.submit(feature) {
            tracing::debug!("Dropping feature {}: {}", chunk.ordinal, e);
        }
    }
}
