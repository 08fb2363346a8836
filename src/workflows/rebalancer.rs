//! Retroactive rebalancer: decide whether an existing event is a consequence
//! of one of several candidates and, if so, add the edge.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::core::activities::{ApplyGraphMutation, DetermineCausality};
use crate::core::{WorkflowContext, WorkflowError, WorkflowHost};
use crate::domain::{GraphMutation, RebalanceRequest, WorkflowId, WorkflowKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RebalanceOutcome {
    Linked {
        parent_event_id: String,
        relationship_type: String,
        confidence: f64,
    },
    NoLink {
        reasoning: String,
    },
}

/// Run a rebalance under a fresh identity
pub async fn execute(
    host: &WorkflowHost,
    request: RebalanceRequest,
) -> Result<RebalanceOutcome, WorkflowError> {
    execute_as(host, WorkflowId::for_rebalance(), request).await
}

/// Run (or resume) a rebalance under `id`
#[instrument(skip(host, request), fields(target = %request.target_event_id))]
pub async fn execute_as(
    host: &WorkflowHost,
    id: WorkflowId,
    request: RebalanceRequest,
) -> Result<RebalanceOutcome, WorkflowError> {
    validate(&request)?;

    let mut ctx = host
        .open_context(&id, WorkflowKind::Rebalance, &request, host.settings().rebalance.clone())
        .await?;
    let result = run(&mut ctx, &request).await;
    ctx.finish(result).await
}

fn validate(request: &RebalanceRequest) -> Result<(), WorkflowError> {
    if request.target_event_id.trim().is_empty() {
        return Err(WorkflowError::InvalidInput("target event id is empty".to_string()));
    }
    if request.candidate_events.is_empty() {
        return Err(WorkflowError::InvalidInput("no candidate events".to_string()));
    }
    Ok(())
}

/// The rebalance body
pub async fn run(
    ctx: &mut WorkflowContext,
    request: &RebalanceRequest,
) -> Result<RebalanceOutcome, WorkflowError> {
    let verdict = ctx.execute::<DetermineCausality>(request).await?;

    if !verdict.is_consequence {
        info!("No causal link found");
        return Ok(RebalanceOutcome::NoLink {
            reasoning: verdict.reasoning,
        });
    }

    let mutation = GraphMutation {
        child_id: request.target_event_id.clone(),
        result: verdict,
    };
    ctx.execute::<ApplyGraphMutation>(&mutation).await?;

    info!(
        parent = %mutation.result.parent_event_id,
        relationship = %mutation.result.relationship_type,
        "Causal link applied"
    );
    Ok(RebalanceOutcome::Linked {
        parent_event_id: mutation.result.parent_event_id,
        relationship_type: mutation.result.relationship_type,
        confidence: mutation.result.confidence,
    })
}
