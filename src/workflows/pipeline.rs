//! Per-article pipeline: one URL to a stored, graph-linked article.
//!
//! Steps run strictly in order through the workflow context, so each is
//! retried on its own and skipped on replay once it has completed:
//! extract, embed, duplicate check, analyze, assemble, persist, link.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::core::activities::{Analyze, CheckDuplicates, Embed, Extract, LinkGraph, Persist};
use crate::core::{WorkflowContext, WorkflowError, WorkflowHost};
use crate::domain::{ArticleRecord, ProcessingRequest, RecordStamp, WorkflowId, WorkflowKind};

/// How a pipeline run ended successfully
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// New article persisted and linked
    Stored { article_id: Uuid, url: String },

    /// A stored article was similar enough; nothing was written
    Duplicate { existing_id: Uuid, similarity: f64 },
}

/// Run (or resume) the pipeline for `request` under its article identity
#[instrument(skip(host, request), fields(url = %request.target_url))]
pub async fn execute(
    host: &WorkflowHost,
    request: ProcessingRequest,
) -> Result<PipelineOutcome, WorkflowError> {
    request
        .validate()
        .map_err(|e| WorkflowError::InvalidInput(e.to_string()))?;

    let id = WorkflowId::for_article(&request.target_url);
    let mut ctx = host
        .open_context(&id, WorkflowKind::Pipeline, &request, host.settings().pipeline.clone())
        .await?;

    let result = run(&mut ctx, &request, host.settings().dedup_threshold).await;
    ctx.finish(result).await
}

/// The pipeline body
pub async fn run(
    ctx: &mut WorkflowContext,
    request: &ProcessingRequest,
    dedup_threshold: f64,
) -> Result<PipelineOutcome, WorkflowError> {
    let url = &request.target_url;

    let raw_content = ctx.execute::<Extract>(url).await?;
    let embedding = ctx.execute::<Embed>(&raw_content).await?;

    let similarity = ctx.execute::<CheckDuplicates>(&embedding).await?;
    if similarity.is_duplicate(dedup_threshold) {
        if let Some(existing) = similarity.existing_article {
            info!(
                existing_id = %existing.id,
                score = similarity.similarity_score,
                "Duplicate detected, stopping pipeline"
            );
            return Ok(PipelineOutcome::Duplicate {
                existing_id: existing.id,
                similarity: similarity.similarity_score,
            });
        }
    }

    let analysis = ctx.execute::<Analyze>(&raw_content).await?;

    let stamp: RecordStamp = ctx.side_effect("assemble", RecordStamp::fresh).await?;
    let mut record = ArticleRecord::assemble(
        stamp,
        url,
        raw_content,
        embedding,
        analysis,
    );
    record
        .verify_integrity()
        .map_err(|e| WorkflowError::InvalidInput(e.to_string()))?;

    // A URL stored before keeps its first id
    let article_id = ctx.execute::<Persist>(&record).await?;
    record.id = article_id;
    ctx.execute::<LinkGraph>(&record).await?;

    info!(%article_id, "Article stored and linked");
    Ok(PipelineOutcome::Stored {
        article_id,
        url: url.clone(),
    })
}
