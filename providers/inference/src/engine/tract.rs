use super::{
    ExecutionTarget, Graph, GraphOptimization, InferenceError, InferenceResult, ModelRuntime,
    Session, SessionOptions, TensorMap,
};
use async_trait::async_trait;
use ml_types::Tensor;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::RwLock;
use tract_onnx::prelude::{
    Datum, Framework, InferenceFact, InferenceModelExt, TVec, TValue, Tensor as TractTensor,
    TypedModel, TypedRunnableModel,
};

type Plan = TypedRunnableModel<TypedModel>;

/// ONNX runtime backed by tract. CPU only, one thread per inference.
#[derive(Clone, Default)]
pub struct TractEngine {
    state: Arc<RwLock<ModelState>>,
}

#[derive(Default)]
struct ModelState {
    next_graph: Graph,
    plans: HashMap<Graph, Arc<Plan>>,
}

struct BuiltModel {
    plan: Plan,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

#[async_trait]
impl ModelRuntime for TractEngine {
    async fn load(&self, model: Vec<u8>, options: &SessionOptions) -> InferenceResult<Session> {
        if options.execution_target != ExecutionTarget::Cpu {
            log::error!(
                "load() - unsupported execution target '{:?}'",
                options.execution_target
            );
            return Err(InferenceError::UnsupportedExecutionTarget(
                options.execution_target,
            ));
        }

        if options.intra_op_threads != 1 {
            log::warn!(
                "load() - tract runs inference on the calling thread, ignoring intra_op_threads={}",
                options.intra_op_threads
            );
        }

        let options = options.clone();
        let built = tokio::task::spawn_blocking(move || build(model, &options))
            .await
            .map_err(|e| InferenceError::RuntimeError(format!("internal join error: {}", e)))??;

        let mut state = self.state.write().await;
        let graph = state.next_graph;
        state.next_graph = state.next_graph.wrapping_add(1);
        state.plans.insert(graph, Arc::new(built.plan));

        log::debug!(
            "load() - graph {} ready with inputs {:?} and outputs {:?}",
            graph,
            &built.input_names,
            &built.output_names
        );

        Ok(Session {
            graph,
            input_names: built.input_names,
            output_names: built.output_names,
        })
    }

    async fn run(&self, session: &Session, mut inputs: TensorMap) -> InferenceResult<TensorMap> {
        let plan = {
            let state = self.state.read().await;
            state
                .plans
                .get(&session.graph)
                .cloned()
                .ok_or(InferenceError::GraphNotFound(session.graph))?
        };

        let mut tensors = Vec::with_capacity(session.input_names.len());
        for name in &session.input_names {
            let tensor = inputs
                .remove(name)
                .ok_or_else(|| InferenceError::MissingInput(name.clone()))?;
            tensors.push(to_tract(&tensor)?);
        }

        let outputs = tokio::task::spawn_blocking(move || execute(&plan, tensors))
            .await
            .map_err(|e| InferenceError::RuntimeError(format!("internal join error: {}", e)))??;

        Ok(session
            .output_names
            .iter()
            .cloned()
            .zip(outputs)
            .collect())
    }

    async fn drop_session(&self, session: &Session) {
        if self.state.write().await.plans.remove(&session.graph).is_none() {
            log::warn!("drop_session() - graph {} was not loaded", session.graph);
        }
    }
}

fn build(model: Vec<u8>, options: &SessionOptions) -> InferenceResult<BuiltModel> {
    let mut model = tract_onnx::onnx()
        .model_for_read(&mut Cursor::new(model))
        .map_err(|e| InferenceError::FailedToBuildModelFromBuffer(e.to_string()))?;

    if let Some(shape) = &options.input_shape {
        let shape: TVec<usize> = shape.iter().copied().collect();
        model = model.with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape))?;
    }

    let input_names = model
        .input_outlets()?
        .iter()
        .map(|outlet| model.node(outlet.node).name.clone())
        .collect();

    let output_names = model
        .output_outlets()?
        .iter()
        .map(|outlet| {
            model
                .outlet_label(*outlet)
                .map(String::from)
                .unwrap_or_else(|| model.node(outlet.node).name.clone())
        })
        .collect();

    let typed = match options.optimization {
        GraphOptimization::All => model.into_optimized(),
        GraphOptimization::Disabled => model.into_typed(),
    }
    .map_err(|e| InferenceError::FailedToBuildModelFromBuffer(e.to_string()))?;

    let plan = typed
        .into_runnable()
        .map_err(|e| InferenceError::FailedToBuildModelFromBuffer(e.to_string()))?;

    Ok(BuiltModel {
        plan,
        input_names,
        output_names,
    })
}

fn execute(plan: &Plan, inputs: Vec<TractTensor>) -> InferenceResult<Vec<Tensor>> {
    let values: TVec<TValue> = inputs.into_iter().map(TValue::from).collect();

    let outputs = plan
        .run(values)
        .map_err(|e| InferenceError::RuntimeError(e.to_string()))?;

    outputs.iter().map(|value| from_tract(value)).collect()
}

fn to_tract(tensor: &Tensor) -> InferenceResult<TractTensor> {
    let shape: Vec<usize> = tensor.shape.iter().map(|d| *d as usize).collect();
    let data = tensor.to_f32_vec()?;

    TractTensor::from_shape::<f32>(&shape, &data)
        .map_err(|e| InferenceError::ReShapeError(e.to_string()))
}

fn from_tract(value: &TractTensor) -> InferenceResult<Tensor> {
    let view = value
        .to_array_view::<f32>()
        .map_err(|e| InferenceError::RuntimeError(format!("unexpected output type: {}", e)))?;

    let shape: Vec<u32> = view.shape().iter().map(|d| *d as u32).collect();
    let values: Vec<f32> = view.iter().copied().collect();

    Ok(Tensor::from_f32(&shape, &values)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_buffer_fails_to_load() {
        let engine = TractEngine::default();
        let result = engine
            .load(b"definitely not onnx".to_vec(), &SessionOptions::default())
            .await;

        assert!(matches!(
            result,
            Err(InferenceError::FailedToBuildModelFromBuffer(_))
        ));
    }

    #[tokio::test]
    async fn non_cpu_targets_are_rejected() {
        let engine = TractEngine::default();
        let options = SessionOptions {
            execution_target: ExecutionTarget::Gpu,
            ..SessionOptions::default()
        };

        assert!(matches!(
            engine.load(vec![], &options).await,
            Err(InferenceError::UnsupportedExecutionTarget(ExecutionTarget::Gpu))
        ));
    }

    #[tokio::test]
    async fn unknown_graph_cannot_run() {
        let engine = TractEngine::default();
        let session = Session {
            graph: 42,
            input_names: vec!["input".into()],
            output_names: vec!["output".into()],
        };

        assert!(matches!(
            engine.run(&session, TensorMap::new()).await,
            Err(InferenceError::GraphNotFound(42))
        ));
    }

    #[test]
    fn tensors_convert_both_ways() {
        let tensor = Tensor::from_f32(&[1, 2, 2], &[0.0, 0.25, 0.5, 1.0]).unwrap();
        let tract = to_tract(&tensor).unwrap();
        assert_eq!(tract.shape(), &[1, 2, 2]);
        assert_eq!(from_tract(&tract).unwrap(), tensor);
    }
}
