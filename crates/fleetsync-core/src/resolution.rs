// ── Drift resolution workflow ──
//
// A resolution request asks for drifting fields on one device to be
// brought back to their desired values. The first enabled policy that
// covers the fields decides whether it applies immediately or waits for
// approval. Applying pushes the affected capability groups of the
// desired configuration.

use chrono::Utc;
use tracing::{info, warn};

use crate::configuration::push_config;
use crate::engine::Engine;
use crate::error::CoreError;
use crate::model::{
    CapabilityGroup, ConfigAction, ConfigSource, DeviceId, PolicyDraft, PolicyId,
    ResolutionHistory, ResolutionHistoryId, ResolutionMetrics, ResolutionPolicy,
    ResolutionRequest, ResolutionStatus, RequestId, TrendQuery,
};

/// Capability groups touched by dotted field paths.
fn affected_groups(fields: &[String]) -> Result<Vec<CapabilityGroup>, CoreError> {
    let mut groups = Vec::new();
    for field in fields {
        let head = field.split('.').next().unwrap_or_default();
        let group = head.parse::<CapabilityGroup>().map_err(|_| {
            CoreError::validation(format!("'{field}' is not a capability group field"))
        })?;
        if !groups.contains(&group) {
            groups.push(group);
        }
    }
    groups.sort();
    Ok(groups)
}

fn validate_policy(draft: &PolicyDraft) -> Result<(), CoreError> {
    if draft.name.trim().is_empty() {
        return Err(CoreError::validation("policy name is required"));
    }
    if draft.field_prefixes.iter().any(|p| p.trim().is_empty()) {
        return Err(CoreError::validation("policy field prefixes must not be blank"));
    }
    Ok(())
}

impl Engine {
    // ── Policies ─────────────────────────────────────────────────────

    pub async fn create_policy(&self, draft: PolicyDraft) -> Result<ResolutionPolicy, CoreError> {
        validate_policy(&draft)?;
        let now = Utc::now();
        self.inner
            .store
            .insert_policy(ResolutionPolicy {
                id: PolicyId::default(),
                name: draft.name.trim().to_owned(),
                enabled: draft.enabled,
                auto_apply: draft.auto_apply,
                requires_approval: draft.requires_approval,
                field_prefixes: draft.field_prefixes,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    pub async fn update_policy(
        &self,
        id: PolicyId,
        draft: PolicyDraft,
    ) -> Result<ResolutionPolicy, CoreError> {
        validate_policy(&draft)?;
        let mut policy = self.get_policy(id).await?;
        policy.name = draft.name.trim().to_owned();
        policy.enabled = draft.enabled;
        policy.auto_apply = draft.auto_apply;
        policy.requires_approval = draft.requires_approval;
        policy.field_prefixes = draft.field_prefixes;
        policy.updated_at = Utc::now();
        self.inner.store.update_policy(policy).await
    }

    pub async fn get_policy(&self, id: PolicyId) -> Result<ResolutionPolicy, CoreError> {
        self.inner
            .store
            .get_policy(id)
            .await?
            .ok_or_else(|| CoreError::not_found("resolution policy", id))
    }

    pub async fn list_policies(&self) -> Result<Vec<ResolutionPolicy>, CoreError> {
        self.inner.store.list_policies().await
    }

    pub async fn delete_policy(&self, id: PolicyId) -> Result<(), CoreError> {
        if self.inner.store.delete_policy(id).await? {
            Ok(())
        } else {
            Err(CoreError::not_found("resolution policy", id))
        }
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Open a request for `fields` on a device. With an auto-apply policy
    /// that needs no approval the request is applied right away; the
    /// returned request then carries the final status.
    pub async fn create_resolution_request(
        &self,
        device_id: DeviceId,
        fields: Vec<String>,
    ) -> Result<ResolutionRequest, CoreError> {
        if fields.is_empty() {
            return Err(CoreError::validation("resolution request names no fields"));
        }
        affected_groups(&fields)?;
        self.get_device(device_id).await?;

        let policy = self
            .list_policies()
            .await?
            .into_iter()
            .find(|p| p.enabled && p.covers(&fields));

        let now = Utc::now();
        let request = self
            .inner
            .store
            .insert_request(ResolutionRequest {
                id: RequestId::default(),
                device_id,
                fields,
                status: ResolutionStatus::Pending,
                policy_id: policy.as_ref().map(|p| p.id),
                reason: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        match policy {
            Some(p) if p.auto_apply && !p.requires_approval => {
                info!(request = %request.id, policy = %p.name, "auto-applying resolution");
                match self.apply_resolution_request(request.id).await {
                    Ok(applied) => Ok(applied),
                    // Failure is already recorded on the request.
                    Err(_) => self.get_resolution_request(request.id).await,
                }
            }
            _ => Ok(request),
        }
    }

    pub async fn get_resolution_request(
        &self,
        id: RequestId,
    ) -> Result<ResolutionRequest, CoreError> {
        self.inner
            .store
            .get_request(id)
            .await?
            .ok_or_else(|| CoreError::not_found("resolution request", id))
    }

    pub async fn list_resolution_requests(&self) -> Result<Vec<ResolutionRequest>, CoreError> {
        self.inner.store.list_requests().await
    }

    pub async fn approve_resolution_request(
        &self,
        id: RequestId,
    ) -> Result<ResolutionRequest, CoreError> {
        self.transition_pending(id, ResolutionStatus::Approved, None)
            .await
    }

    pub async fn reject_resolution_request(
        &self,
        id: RequestId,
        reason: Option<String>,
    ) -> Result<ResolutionRequest, CoreError> {
        let request = self
            .transition_pending(id, ResolutionStatus::Rejected, reason)
            .await?;
        self.record_resolution(&request, ResolutionStatus::Rejected, Vec::new(), None)
            .await?;
        Ok(request)
    }

    async fn transition_pending(
        &self,
        id: RequestId,
        status: ResolutionStatus,
        reason: Option<String>,
    ) -> Result<ResolutionRequest, CoreError> {
        let mut request = self.get_resolution_request(id).await?;
        if request.status != ResolutionStatus::Pending {
            return Err(CoreError::validation(format!(
                "request {id} is {}, only pending requests can be {status}",
                request.status
            )));
        }
        request.status = status;
        request.reason = reason;
        request.updated_at = Utc::now();
        self.inner.store.update_request(request).await
    }

    /// Push the desired values of the request's capability groups.
    ///
    /// Allowed for approved requests, and for pending ones whose policy
    /// does not require approval. A failed push marks the request failed
    /// and is returned as an error.
    pub async fn apply_resolution_request(
        &self,
        id: RequestId,
    ) -> Result<ResolutionRequest, CoreError> {
        let mut request = self.get_resolution_request(id).await?;
        let needs_approval = match request.policy_id {
            Some(policy_id) => self
                .inner
                .store
                .get_policy(policy_id)
                .await?
                .is_none_or(|p| p.requires_approval),
            None => true,
        };
        let allowed = match request.status {
            ResolutionStatus::Approved => true,
            ResolutionStatus::Pending => !needs_approval,
            _ => false,
        };
        if !allowed {
            return Err(CoreError::validation(format!(
                "request {id} is {} and cannot be applied",
                request.status
            )));
        }

        let groups = affected_groups(&request.fields)?;
        let group_names: Vec<String> = groups.iter().map(ToString::to_string).collect();
        let pushed = self.push_groups(request.device_id, &groups).await;

        request.updated_at = Utc::now();
        match pushed {
            Ok(()) => {
                request.status = ResolutionStatus::Applied;
                request.reason = None;
                let request = self.inner.store.update_request(request).await?;
                self.record_resolution(&request, ResolutionStatus::Applied, group_names, None)
                    .await?;
                info!(request = %id, device = %request.device_id, "resolution applied");
                Ok(request)
            }
            Err(e) => {
                warn!(request = %id, error = %e, "resolution failed");
                request.status = ResolutionStatus::Failed;
                request.reason = Some(e.to_string());
                let request = self.inner.store.update_request(request).await?;
                self.record_resolution(
                    &request,
                    ResolutionStatus::Failed,
                    group_names,
                    Some(e.to_string()),
                )
                .await?;
                Err(e)
            }
        }
    }

    async fn push_groups(
        &self,
        device_id: DeviceId,
        groups: &[CapabilityGroup],
    ) -> Result<(), CoreError> {
        let desired = self.desired_configuration(device_id).await?;
        let subset = desired.config.restricted_to(groups);
        if subset.is_empty() {
            return Err(CoreError::validation(
                "desired configuration sets none of the requested groups",
            ));
        }
        let timeout = self.config().timeouts.control;
        self.on_device(device_id, "apply_resolution", timeout, |client, ctx| {
            push_config(client, ctx, &subset)
        })
        .await?;

        let mut stored = self.stored_configuration(device_id).await?;
        stored.overlay(&subset);
        self.record_configuration(
            device_id,
            &stored,
            ConfigSource::Pushed,
            ConfigAction::ResolutionApplied,
        )
        .await?;
        Ok(())
    }

    async fn record_resolution(
        &self,
        request: &ResolutionRequest,
        outcome: ResolutionStatus,
        applied_groups: Vec<String>,
        error: Option<String>,
    ) -> Result<ResolutionHistory, CoreError> {
        self.inner
            .store
            .insert_resolution_history(ResolutionHistory {
                id: ResolutionHistoryId::default(),
                request_id: request.id,
                device_id: request.device_id,
                outcome,
                applied_groups,
                error,
                at: Utc::now(),
            })
            .await
    }

    pub async fn list_resolution_history(
        &self,
        request_id: Option<RequestId>,
    ) -> Result<Vec<ResolutionHistory>, CoreError> {
        self.inner.store.list_resolution_history(request_id).await
    }

    /// Counts of requests by status plus open and resolved trends.
    pub async fn resolution_metrics(&self) -> Result<ResolutionMetrics, CoreError> {
        let mut metrics = ResolutionMetrics::default();
        for request in self.list_resolution_requests().await? {
            metrics.total_requests += 1;
            match request.status {
                ResolutionStatus::Pending => metrics.pending += 1,
                ResolutionStatus::Approved => metrics.approved += 1,
                ResolutionStatus::Rejected => metrics.rejected += 1,
                ResolutionStatus::Applied => metrics.applied += 1,
                ResolutionStatus::Failed => metrics.failed += 1,
            }
        }
        for trend in self.list_trends(TrendQuery::default()).await? {
            if trend.resolved {
                metrics.resolved_trends += 1;
            } else {
                metrics.open_trends += 1;
            }
        }
        Ok(metrics)
    }
}
