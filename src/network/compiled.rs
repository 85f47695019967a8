use crate::{
    backend::Backend,
    data::DataStream,
    layers::{Classifier, InferencePass, Layer, Objective, PendingUpdate, TrainPass},
    optimizer::Optimizer,
    param::{unique_params, Param, Regularization, UpdateRule},
    persist, Error, Result, Tensor,
};
use log::{debug, trace};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::io::{Read, Write};

/// One mini-batch: inputs and their class-index labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn new(input: Tensor, labels: Tensor) -> Self {
        Self { input, labels }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepMetrics {
    /// Objective plus regularisation penalties.
    pub loss: f32,
    pub objective: f32,
    /// Fraction of misclassified samples.
    pub error: f32,
}

/// Structure handed over by [`super::Network::finalize`].
pub(super) struct Graph {
    pub layers: Vec<Box<dyn Layer>>,
    pub index: HashMap<String, usize>,
    pub origins: Vec<Vec<usize>>,
    pub train_path: Vec<usize>,
    pub inference_path: Vec<usize>,
    pub input: usize,
    pub classifier: usize,
    pub objective: usize,
    pub seed: u64,
}

struct TrainOutcome {
    metrics: StepMetrics,
    updates: Vec<PendingUpdate>,
}

/// A finalised layer graph.
///
/// The structure is fixed; only parameter values change, and only through
/// [`CompiledNetwork::train_step`] or [`CompiledNetwork::load_params`].
#[derive(Debug)]
pub struct CompiledNetwork {
    layers: Vec<Box<dyn Layer>>,
    index: HashMap<String, usize>,
    origins: Vec<Vec<usize>>,
    train_path: Vec<usize>,
    inference_path: Vec<usize>,
    input: usize,
    classifier: usize,
    objective: usize,
    params: Vec<Param>,
    trainable: Vec<Param>,
    auxiliary: Vec<Param>,
    rules: Vec<UpdateRule>,
    regularization: Regularization,
    coefficients: (f32, f32),
    seed: u64,
    steps: u64,
}

impl CompiledNetwork {
    pub(super) fn new(graph: Graph) -> Result<Self> {
        let coefficients = graph.layers[graph.objective]
            .as_objective()
            .map(Objective::regularization_coefficients)
            .ok_or_else(|| {
                Error::IncompleteGraph(format!(
                    "layer `{}` is not an objective",
                    graph.layers[graph.objective].id()
                ))
            })?;

        let layers = &graph.layers;
        let on_path = || graph.train_path.iter().map(move |&i| &layers[i]);

        let params = unique_params(on_path().flat_map(|l| l.params()));
        let trainable: Vec<Param> = params.iter().filter(|p| p.is_trainable()).cloned().collect();
        let auxiliary: Vec<Param> = params
            .iter()
            .filter(|p| !p.is_trainable())
            .cloned()
            .collect();

        let mut rules: Vec<UpdateRule> = Vec::new();
        for rule in on_path().flat_map(|l| l.update_rules()) {
            if rule.target.is_trainable() {
                return Err(Error::config(
                    rule.target.name(),
                    "update rules may only target auxiliary parameters",
                ));
            }
            if !rules.iter().any(|r| r.target.ptr_eq(&rule.target)) {
                rules.push(rule.clone());
            }
        }

        let regularization = Regularization::over(&trainable);

        Ok(Self {
            layers: graph.layers,
            index: graph.index,
            origins: graph.origins,
            train_path: graph.train_path,
            inference_path: graph.inference_path,
            input: graph.input,
            classifier: graph.classifier,
            objective: graph.objective,
            params,
            trainable,
            auxiliary,
            rules,
            regularization,
            coefficients,
            seed: graph.seed,
            steps: 0,
        })
    }

    pub fn layer(&self, id: &str) -> Option<&dyn Layer> {
        self.index.get(id).map(|&i| self.layers[i].as_ref())
    }

    /// Ids along the train path, in evaluation order.
    pub fn train_path(&self) -> Vec<&str> {
        self.train_path.iter().map(|&i| self.layers[i].id()).collect()
    }

    pub fn inference_path(&self) -> Vec<&str> {
        self.inference_path
            .iter()
            .map(|&i| self.layers[i].id())
            .collect()
    }

    pub fn input_id(&self) -> &str {
        self.layers[self.input].id()
    }

    pub fn classifier_id(&self) -> &str {
        self.layers[self.classifier].id()
    }

    pub fn objective_id(&self) -> &str {
        self.layers[self.objective].id()
    }

    /// Every parameter on the train path, each handle once.
    pub fn all_params(&self) -> &[Param] {
        &self.params
    }

    pub fn trainable_params(&self) -> &[Param] {
        &self.trainable
    }

    pub fn auxiliary_params(&self) -> &[Param] {
        &self.auxiliary
    }

    pub fn all_update_rules(&self) -> &[UpdateRule] {
        &self.rules
    }

    /// Σ|p| over the unique trainable parameters.
    pub fn l1(&self) -> f32 {
        self.regularization.l1()
    }

    /// Σp² over the unique trainable parameters.
    pub fn l2(&self) -> f32 {
        self.regularization.l2()
    }

    /// Number of committed train steps.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn objective_layer(&self) -> Result<&Objective> {
        self.layers[self.objective].as_objective().ok_or_else(|| {
            Error::IncompleteGraph(format!(
                "layer `{}` is not an objective",
                self.objective_id()
            ))
        })
    }

    fn gather<'t>(
        &self,
        idx: usize,
        input: &'t Tensor,
        outputs: &'t [Option<Tensor>],
    ) -> Result<Vec<&'t Tensor>> {
        if idx == self.input {
            return Ok(vec![input]);
        }
        self.origins[idx]
            .iter()
            .map(|&o| {
                outputs[o].as_ref().ok_or_else(|| {
                    Error::Layer(format!(
                        "layer `{}` evaluated before its origin `{}`",
                        self.layers[idx].id(),
                        self.layers[o].id()
                    ))
                })
            })
            .collect()
    }

    fn output_of(&self, idx: usize, outputs: &[Option<Tensor>]) -> Result<Tensor> {
        outputs[idx].clone().ok_or_else(|| {
            Error::Layer(format!("layer `{}` produced no output", self.layers[idx].id()))
        })
    }

    fn penalty(&self) -> f32 {
        let (l1, l2) = self.coefficients;
        let mut penalty = 0.0;
        if l1 != 0.0 {
            penalty += l1 * self.regularization.l1();
        }
        if l2 != 0.0 {
            penalty += l2 * self.regularization.l2();
        }
        penalty
    }

    fn metrics(&self, outputs: &[Option<Tensor>], labels: &Tensor) -> Result<StepMetrics> {
        let objective = self.output_of(self.objective, outputs)?.data()[[0]];
        let scores = self.output_of(self.classifier, outputs)?;
        let error = self.objective_layer()?.error_rate(&scores, labels)?;
        Ok(StepMetrics {
            loss: objective + self.penalty(),
            objective,
            error,
        })
    }

    /// Train-branch forward pass; reads parameters, writes nothing.
    fn train_forward(&self, batch: &Batch, seed: u64) -> Result<TrainOutcome> {
        let mut pass = TrainPass::new(Some(&batch.labels), seed);
        let mut outputs: Vec<Option<Tensor>> = vec![None; self.layers.len()];

        for &idx in &self.train_path {
            let out = {
                let inputs = self.gather(idx, &batch.input, &outputs)?;
                self.layers[idx].train_output(&inputs, &mut pass)?
            };
            outputs[idx] = Some(out);
        }

        let metrics = self.metrics(&outputs, &batch.labels)?;
        Ok(TrainOutcome {
            metrics,
            updates: pass.into_updates(),
        })
    }

    fn inference_forward(
        &self,
        path: &[usize],
        input: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<Vec<Option<Tensor>>> {
        let pass = InferencePass::new(labels);
        let mut outputs: Vec<Option<Tensor>> = vec![None; self.layers.len()];

        for &idx in path {
            let out = {
                let inputs = self.gather(idx, input, &outputs)?;
                self.layers[idx].inference_output(&inputs, &pass)?
            };
            outputs[idx] = Some(out);
        }
        Ok(outputs)
    }

    /// Runs one atomic training step on `batch`.
    ///
    /// The loss is evaluated on the train branch, `backend` differentiates it
    /// with respect to every trainable parameter, `optimizer` proposes new
    /// values and the update rules give new auxiliary values. Everything is
    /// validated before any write; on error no parameter and no optimizer
    /// state has changed.
    pub fn train_step<B, O>(
        &mut self,
        batch: &Batch,
        backend: &B,
        optimizer: &mut O,
    ) -> Result<StepMetrics>
    where
        B: Backend + ?Sized,
        O: Optimizer + ?Sized,
    {
        let seed = self.seed.wrapping_add(self.steps);
        let outcome = self.train_forward(batch, seed)?;

        let grads = {
            let mut loss = || self.train_forward(batch, seed).map(|o| o.metrics.loss);
            backend.gradients(&mut loss, &self.trainable)?
        };
        validate(&self.trainable, &grads)?;

        let proposed = match optimizer.propose(&self.trainable, &grads) {
            Ok(proposed) => proposed,
            Err(e) => {
                optimizer.discard();
                return Err(e);
            }
        };
        let checked = validate(&self.trainable, &proposed).and_then(|_| {
            outcome.updates.iter().try_for_each(|u| {
                u.target.check_shape(u.value.shape())?;
                check_finite(&u.target, &u.value)
            })
        });
        if let Err(e) = checked {
            optimizer.discard();
            return Err(e);
        }

        commit(&self.trainable, proposed, outcome.updates);
        optimizer.commit();
        self.steps += 1;

        trace!(
            "step {}: loss {:.6}, objective {:.6}, error {:.4}",
            self.steps,
            outcome.metrics.loss,
            outcome.metrics.objective,
            outcome.metrics.error
        );
        Ok(outcome.metrics)
    }

    /// Classifier output on the inference branch.
    pub fn inference_step(&self, input: &Tensor) -> Result<Tensor> {
        let outputs = self.inference_forward(&self.inference_path, input, None)?;
        self.output_of(self.classifier, &outputs)
    }

    /// Predicted class per sample.
    pub fn predict(&self, input: &Tensor) -> Result<Vec<usize>> {
        Classifier::predictions(&self.inference_step(input)?)
    }

    /// Objective and error rate on the inference branch; nothing is written.
    pub fn evaluate(&self, batch: &Batch) -> Result<StepMetrics> {
        let outputs =
            self.inference_forward(&self.train_path, &batch.input, Some(&batch.labels))?;
        self.metrics(&outputs, &batch.labels)
    }

    /// One [`CompiledNetwork::train_step`] per batch of `stream`; returns the
    /// mean metrics of the epoch.
    pub fn train_epoch<S, B, O>(
        &mut self,
        stream: &mut S,
        backend: &B,
        optimizer: &mut O,
    ) -> Result<StepMetrics>
    where
        S: DataStream + ?Sized,
        B: Backend + ?Sized,
        O: Optimizer + ?Sized,
    {
        let batches = stream.size();
        let mut total = StepMetrics::default();
        for _ in 0..batches {
            let batch = stream.next_batch()?;
            let m = self.train_step(&batch, backend, optimizer)?;
            total.loss += m.loss;
            total.objective += m.objective;
            total.error += m.error;
        }

        if batches > 0 {
            let n = batches as f32;
            total.loss /= n;
            total.objective /= n;
            total.error /= n;
        }
        debug!(
            "epoch of {} batches: loss {:.6}, error {:.4}",
            batches, total.loss, total.error
        );
        Ok(total)
    }

    pub fn save_params<W: Write>(&self, writer: W) -> Result<()> {
        persist::save_params(&self.params, writer)
    }

    /// Replaces every parameter value from a snapshot written by
    /// [`CompiledNetwork::save_params`].
    pub fn load_params<R: Read>(&self, reader: R) -> Result<()> {
        persist::load_params(&self.params, reader)
    }

    pub fn summary(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!(
            "Network: {} -> {} -> {}\n",
            self.input_id(),
            self.classifier_id(),
            self.objective_id()
        ));
        s.push_str("_________________________________________________________________\n");
        s.push_str("Layer (type)                 Output Shape              Params\n");
        s.push_str("=================================================================\n");

        for &idx in &self.train_path {
            let layer = &self.layers[idx];
            let count: usize = layer.params().iter().map(Param::len).sum();
            s.push_str(&format!(
                "{:28} {:25} {}\n",
                format!("{} ({})", layer.id(), layer.layer_type()),
                format!("{:?}", layer.output_shape()),
                count
            ));
        }

        let trainable: usize = self.trainable.iter().map(Param::len).sum();
        let auxiliary: usize = self.auxiliary.iter().map(Param::len).sum();
        s.push_str("=================================================================\n");
        s.push_str(&format!("Total layers: {}\n", self.train_path.len()));
        s.push_str(&format!("Trainable params: {}\n", trainable));
        s.push_str(&format!("Auxiliary params: {}\n", auxiliary));

        s
    }
}

fn check_finite(param: &Param, value: &ArrayD<f32>) -> Result<()> {
    if value.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::NonFinite(param.name().to_string()))
    }
}

/// One finite value of the right shape per parameter.
fn validate(params: &[Param], values: &[ArrayD<f32>]) -> Result<()> {
    if params.len() != values.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![params.len()],
            actual: vec![values.len()],
        });
    }
    for (param, value) in params.iter().zip(values) {
        param.check_shape(value.shape())?;
        check_finite(param, value)?;
    }
    Ok(())
}

/// Takes every write lock first, then writes.
fn commit(trainable: &[Param], proposed: Vec<ArrayD<f32>>, updates: Vec<PendingUpdate>) {
    let (targets, values): (Vec<Param>, Vec<ArrayD<f32>>) =
        updates.into_iter().map(|u| (u.target, u.value)).unzip();

    let mut guards: Vec<_> = trainable.iter().chain(&targets).map(Param::write).collect();
    for (guard, value) in guards.iter_mut().zip(proposed.into_iter().chain(values)) {
        **guard = value;
    }
}
