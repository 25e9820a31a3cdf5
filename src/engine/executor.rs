// Workflow executor: the stage chain applied to one message

//! # Workflow Executor
//!
//! Applies, in order, whichever stages a message names:
//!
//! ```text
//! keyword resolution → validator → handler → converter → filter → trigger → returner
//! ```
//!
//! The `simple` workflow runs the handler, the returner and the listeners. The
//! `extended` workflow honors every slot. (`manage` never reaches this module.)
//!
//! ## Stage Failure Policy
//!
//! | Stage | Failure | Caller sees | Downstream |
//! |---|---|---|---|
//! | keyword resolution | missing path | `unresolved_keyword` | nothing runs |
//! | validator | non-empty reason | `validation_failed` | nothing runs |
//! | handler | error | `handler_error` | opted-in trigger, returner and listeners |
//! | handler | `{error}` result | the result | opted-in trigger, returner and listeners |
//! | converter | error | `converter_error` | nothing runs |
//! | converter | `None` | `{}` | nothing runs |
//! | filter | error or `None` | the result | nothing runs |
//! | trigger | error | the result | returner and listeners still run |
//! | returner | error | (already replied) | logged |
//!
//! Every failure is logged with the message's correlation ID.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::bus::Bus;
use super::context::{resolve_keywords, Context};
use super::events::EventPublisher;
use super::reactors::ReactorEngine;
use super::registry::{ExtensionRegistry, HookCall, Returner, Trigger};
use crate::models::result::{self, ResultMap};
use crate::models::{Message, WorkflowKind};
use crate::{EdmpError, Result};

/// Runs the simple and extended workflows
pub struct WorkflowExecutor {
    registry: Arc<ExtensionRegistry>,
    context: Context,
    events: EventPublisher,
    reactors: Arc<ReactorEngine>,
    bus: Bus,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        context: Context,
        events: EventPublisher,
        reactors: Arc<ReactorEngine>,
        bus: Bus,
    ) -> Self {
        Self {
            registry,
            context,
            events,
            reactors,
            bus,
        }
    }

    /// Execute one message and produce the reply
    pub async fn execute(&self, message: Message) -> Result<ResultMap> {
        let correlation_id = message.id;
        let handler = message
            .handler()
            .ok_or_else(|| EdmpError::InvalidInput("message has no handler".to_string()))?
            .to_string();
        let extended = message.workflow() == WorkflowKind::Extended;
        let routing = &message.routing;

        // Resolve every named stage before anything runs
        let registration = self.registry.hook(&handler)?;
        let slot = |name: &Option<String>| extended.then(|| name.clone()).flatten();
        let validator = slot(&routing.validator)
            .map(|name| self.registry.validator(&name))
            .transpose()?;
        let converter = slot(&routing.converter)
            .map(|name| self.registry.converter(&name))
            .transpose()?;
        let filter = slot(&routing.filter)
            .map(|name| self.registry.filter(&name))
            .transpose()?;
        let trigger = slot(&routing.trigger)
            .map(|name| self.registry.trigger(&name))
            .transpose()?;
        let returner = routing
            .returner
            .clone()
            .or_else(|| registration.returner.clone())
            .map(|name| self.registry.returner(&name).map(|returner| (name, returner)))
            .transpose()?;

        let mut kwargs = message.handler_kwargs();
        registration.check_kwargs(&kwargs)?;

        let snapshot = if routing.keyword_resolve || validator.is_some() {
            Some(self.context.snapshot().await)
        } else {
            None
        };

        if let (true, Some(snapshot)) = (routing.keyword_resolve, &snapshot) {
            kwargs = resolve_keywords(&kwargs, snapshot).map_err(|e| {
                warn!(correlation_id = %correlation_id, handler = %handler, error = %e, "keyword resolution failed");
                e
            })?;
        }

        if let (Some(validator), Some(snapshot)) = (&validator, &snapshot) {
            if let Some(reason) = validator(&message.args, &kwargs, snapshot).filter(|r| !r.is_empty()) {
                warn!(correlation_id = %correlation_id, handler = %handler, reason = %reason, "validation failed");
                return Err(EdmpError::ValidationFailed(reason));
            }
        }

        let result_type = routing.result_type.clone().unwrap_or_else(|| handler.clone());
        let call = HookCall {
            correlation_id,
            args: message.args.clone(),
            kwargs,
            context: self.context.clone(),
        };

        let returned = match registration.invoke(call, routing.synchronize).await {
            Ok(returned) => returned,
            Err(e) => {
                let error = match e {
                    EdmpError::Handler(_) => e,
                    other => EdmpError::Handler(other.to_string()),
                };
                warn!(correlation_id = %correlation_id, handler = %handler, error = %error, "handler failed");
                let mut error_result = result::error_result(&error);
                result::ensure_envelope(&mut error_result, &result_type);
                self.short_circuit(message, error_result, trigger, returner).await;
                return Err(error);
            }
        };

        let mut outcome = result::wrap(returned);
        result::ensure_envelope(&mut outcome, &result_type);

        if let Some(reason) = result::error_of(&outcome) {
            debug!(correlation_id = %correlation_id, handler = %handler, error = %reason, "handler returned an error result");
            self.short_circuit(message, outcome.clone(), trigger, returner).await;
            return Ok(outcome);
        }

        if let Some(converter) = converter {
            match converter(outcome) {
                Ok(Some(converted)) => {
                    outcome = converted;
                    result::ensure_envelope(&mut outcome, &result_type);
                }
                Ok(None) => {
                    debug!(correlation_id = %correlation_id, handler = %handler, "converter dropped the result");
                    return Ok(ResultMap::new());
                }
                Err(e) => {
                    warn!(correlation_id = %correlation_id, handler = %handler, error = %e, "converter failed");
                    return Err(EdmpError::Converter(e.to_string()));
                }
            }
        }

        if let Some(filter) = filter {
            match filter(outcome.clone()) {
                Ok(Some(filtered)) => outcome = filtered,
                Ok(None) => {
                    debug!(correlation_id = %correlation_id, handler = %handler, "filter stopped the chain");
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(correlation_id = %correlation_id, handler = %handler, error = %e, "filter failed");
                    return Ok(outcome);
                }
            }
        }

        if let Some(trigger) = trigger {
            if let Err(e) = trigger.fire(&message, &outcome, &self.events).await {
                warn!(correlation_id = %correlation_id, handler = %handler, error = %e, "trigger failed");
            }
        }

        self.post(Arc::new(message), outcome.clone(), returner, false);
        Ok(outcome)
    }

    /// Error outcome: only stages that opted in see it, then error listeners
    async fn short_circuit(
        &self,
        message: Message,
        outcome: ResultMap,
        trigger: Option<Arc<dyn Trigger>>,
        returner: Option<(String, Arc<dyn Returner>)>,
    ) {
        if let Some(trigger) = trigger.filter(|trigger| trigger.accepts_errors()) {
            if let Err(e) = trigger.fire(&message, &outcome, &self.events).await {
                warn!(correlation_id = %message.id, error = %e, "trigger failed on error result");
            }
        }
        let returner = returner.filter(|(_, returner)| returner.accepts_errors());
        self.post(Arc::new(message), outcome, returner, true);
    }

    /// Returner delivery and listener notification, after the reply is ready
    fn post(
        &self,
        message: Arc<Message>,
        outcome: ResultMap,
        returner: Option<(String, Arc<dyn Returner>)>,
        is_error: bool,
    ) {
        let reactors = self.reactors.clone();
        self.bus.spawn(async move {
            if let Some((name, returner)) = returner {
                if let Err(e) = returner.deliver(&message, &outcome).await {
                    warn!(correlation_id = %message.id, returner = %name, error = %e, "returner failed");
                }
            }
            reactors.notify(message, outcome, is_error).await;
        });
    }

    /// Invoke a hook directly, bypassing every other stage
    pub async fn call_hook(&self, name: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<ResultMap> {
        let registration = self.registry.hook(name)?;
        registration.check_kwargs(&kwargs)?;

        let call = HookCall::new(args, kwargs, self.context.clone());
        let returned = registration.invoke(call, true).await.map_err(|e| match e {
            EdmpError::Handler(_) => e,
            other => EdmpError::Handler(other.to_string()),
        })?;

        let mut outcome = result::wrap(returned);
        result::ensure_envelope(&mut outcome, name);
        Ok(outcome)
    }
}
