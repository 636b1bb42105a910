use super::FlowRunner;
use crate::aggregate::{AggregateKind, AggregateRecord};
use dflow_core::cancellation::CancellationSource;
use dflow_core::context::StepContext;
use dflow_core::continuation::{Await, Resumable, Step, Suspension};
use dflow_core::{Fault, FlowId, Outcome, Value};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// A flow runner that executes flows in-process.
///
/// Nothing is persisted: yields and delays are honored in place, and
/// `WhenAll`/`WhenAny` children run one after another. Useful for tests
/// and for flows that never need to outlive the process.
///
/// # Example
///
/// ```rust,ignore
/// let runner = InProcessRunner::default().with_delay_scale(0.0);
/// let outcome = runner.run(Box::new(Countdown::new(3))).await?;
/// ```
#[derive(Debug, Clone)]
pub struct InProcessRunner {
    delay_scale: f64,
    cancellation: Option<Arc<CancellationSource>>,
}

impl Default for InProcessRunner {
    fn default() -> Self {
        Self {
            delay_scale: 1.0,
            cancellation: None,
        }
    }
}

impl InProcessRunner {
    /// Multiply every requested delay by `scale`. `0.0` skips delays.
    /// Negative and NaN scales count as `0.0`; infinite ones as `f64::MAX`.
    #[must_use]
    pub fn with_delay_scale(mut self, scale: f64) -> Self {
        self.delay_scale = if scale.is_nan() {
            0.0
        } else {
            scale.clamp(0.0, f64::MAX)
        };
        self
    }

    /// Observe `source` as the flow's cancellation.
    #[must_use]
    pub fn with_cancellation(mut self, source: Arc<CancellationSource>) -> Self {
        self.cancellation = Some(source);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_deref()
            .is_some_and(CancellationSource::is_cancelled)
    }

    fn scaled(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.delay_scale).unwrap_or(Duration::MAX)
    }

    fn execute_chain(
        &self,
        flow_id: FlowId,
        root: Box<dyn Resumable>,
    ) -> BoxFuture<'_, anyhow::Result<Outcome>> {
        Box::pin(async move {
            let mut stack: Vec<(FlowId, Box<dyn Resumable>)> = vec![(flow_id, root)];
            let mut input: Option<Outcome> = None;

            while let Some((op_id, top)) = stack.last_mut() {
                let step = {
                    let mut cx = StepContext::new(flow_id, *op_id, self.cancellation.as_deref());
                    top.resume(&mut cx, input.take())
                };
                match step {
                    Step::Return(value) => {
                        stack.pop();
                        input = Some(Ok(value));
                    }
                    Step::Fail(fault) => {
                        stack.pop();
                        input = Some(Err(fault));
                    }
                    Step::Await(Await::Call(op)) => stack.push((FlowId::new_operation(), op)),
                    Step::Await(Await::Bridge(future)) => {
                        input = Some(match &self.cancellation {
                            Some(cancellation) => tokio::select! {
                                outcome = future => outcome,
                                _ = cancellation.cancelled() => Err(Fault::cancelled(format!(
                                    "flow '{}' was cancelled while awaiting", flow_id
                                ))),
                            },
                            None => future.await,
                        });
                    }
                    Step::Await(Await::Suspend(_)) if self.is_cancelled() => {
                        input = Some(Err(Fault::cancelled(format!(
                            "flow '{}' was cancelled before suspending",
                            flow_id
                        ))));
                    }
                    Step::Await(Await::Suspend(Suspension::Yield)) => {
                        tokio::task::yield_now().await;
                        input = Some(Ok(Value::Null));
                    }
                    Step::Await(Await::Suspend(Suspension::Delay(delay))) => {
                        tokio::time::sleep(self.scaled(delay)).await;
                        input = Some(Ok(Value::Null));
                    }
                    Step::Await(Await::Suspend(Suspension::Callback(_))) => {
                        anyhow::bail!(
                            "flow '{}' waits for an external resume, which the in-process runner cannot deliver",
                            flow_id
                        );
                    }
                    Step::Await(Await::WhenAll(ops)) => {
                        input = Some(self.execute_aggregate(flow_id, AggregateKind::All, ops).await?);
                    }
                    Step::Await(Await::WhenAny(ops)) => {
                        input = Some(self.execute_aggregate(flow_id, AggregateKind::Any, ops).await?);
                    }
                }
            }

            Ok(input.unwrap_or(Ok(Value::Null)))
        })
    }

    async fn execute_aggregate(
        &self,
        owner: FlowId,
        kind: AggregateKind,
        ops: Vec<Box<dyn Resumable>>,
    ) -> anyhow::Result<Outcome> {
        if kind == AggregateKind::Any && ops.is_empty() {
            return Ok(Err(Fault::failed("WhenAny needs at least one operation")));
        }
        let children: Vec<FlowId> = ops.iter().map(|_| FlowId::new_operation()).collect();
        let mut record = AggregateRecord::new(FlowId::new_operation(), kind, owner, children.clone());
        let mut resolved = record.resolve();
        for (child, op) in children.into_iter().zip(ops) {
            let outcome = self.execute_chain(child, op).await?;
            if resolved.is_none() {
                record.record(child, outcome);
                resolved = record.resolve();
            }
        }
        resolved.ok_or_else(|| anyhow::anyhow!("aggregate left unresolved after every child completed"))
    }
}

impl FlowRunner for InProcessRunner {
    fn run<'r>(&'r self, op: Box<dyn Resumable>) -> BoxFuture<'r, anyhow::Result<Outcome>> {
        Box::pin(async move {
            let id = FlowId::new_flow();
            tracing::debug!(flow_id = %id, op = op.type_name(), "Running flow in process");
            self.execute_chain(id, op).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dflow_core::FlowError;
    use dflow_core::cancellation::CancellationId;
    use dflow_core::continuation::{Deconstructor, decode_outcome};

    struct Constant(i64);

    impl Resumable for Constant {
        fn resume(&mut self, _: &mut StepContext<'_>, _: Option<Outcome>) -> Step {
            Step::ret(&self.0)
        }

        fn deconstruct(&self, _: &mut Deconstructor<'_>) -> Result<(), FlowError> {
            Ok(())
        }
    }

    fn constants(values: &[i64]) -> Vec<Box<dyn Resumable>> {
        values
            .iter()
            .map(|v| Box::new(Constant(*v)) as Box<dyn Resumable>)
            .collect()
    }

    struct Sum {
        stage: u8,
    }

    impl Resumable for Sum {
        fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
            self.stage += 1;
            match self.stage {
                1 => Step::when_all(constants(&[2, 5])),
                2 => Step::delay(Duration::from_secs(60)),
                _ => match decode_outcome::<Value>(input) {
                    Ok(_) => Step::ret(&"done"),
                    Err(fault) => Step::fail(fault),
                },
            }
        }

        fn deconstruct(&self, _: &mut Deconstructor<'_>) -> Result<(), FlowError> {
            Ok(())
        }
    }

    struct Collect;

    impl Resumable for Collect {
        fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
            match input {
                None => Step::when_all(constants(&[2, 5])),
                Some(outcome) => Step::from_outcome(outcome),
            }
        }

        fn deconstruct(&self, _: &mut Deconstructor<'_>) -> Result<(), FlowError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_when_all_collects_in_order() {
        let runner = InProcessRunner::default();
        let outcome = runner.run(Box::new(Collect)).await.unwrap();
        assert_eq!(outcome, Ok(serde_json::json!([2, 5])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_honored() {
        let runner = InProcessRunner::default();
        let outcome = runner.run(Box::new(Sum { stage: 0 })).await.unwrap();
        assert_eq!(outcome, Ok(Value::from("done")));
    }

    #[tokio::test]
    async fn test_cancelled_suspension_faults() {
        let source = CancellationSource::new(CancellationId::new());
        source.trip();
        let runner = InProcessRunner::default()
            .with_delay_scale(0.0)
            .with_cancellation(source);
        let outcome = runner.run(Box::new(Sum { stage: 1 })).await.unwrap();
        assert!(outcome.unwrap_err().is_cancellation());
    }

    struct Stalled;

    impl Resumable for Stalled {
        fn resume(&mut self, _: &mut StepContext<'_>, input: Option<Outcome>) -> Step {
            match input {
                None => Step::bridge(futures::future::pending()),
                Some(outcome) => Step::from_outcome(outcome),
            }
        }

        fn deconstruct(&self, _: &mut Deconstructor<'_>) -> Result<(), FlowError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_bridge() {
        let source = CancellationSource::new(CancellationId::new());
        let runner = InProcessRunner::default().with_cancellation(Arc::clone(&source));
        let (outcome, _) = tokio::join!(runner.run(Box::new(Stalled)), async {
            tokio::task::yield_now().await;
            source.trip();
        });
        let fault = outcome.unwrap().unwrap_err();
        assert!(fault.is_cancellation());
        assert!(fault.to_string().contains("while awaiting"));
    }

    #[tokio::test]
    async fn test_degenerate_delay_scales_do_not_panic() {
        let unbounded = InProcessRunner::default().with_delay_scale(f64::INFINITY);
        assert_eq!(unbounded.scaled(Duration::from_secs(60)), Duration::MAX);
        assert_eq!(unbounded.scaled(Duration::ZERO), Duration::ZERO);

        for scale in [f64::NAN, -1.0] {
            let runner = InProcessRunner::default().with_delay_scale(scale);
            let outcome = runner.run(Box::new(Sum { stage: 1 })).await.unwrap();
            assert_eq!(outcome, Ok(Value::from("done")));
        }
    }
}
