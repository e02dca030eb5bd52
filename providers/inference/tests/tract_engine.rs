use inference::engine::{
    GraphOptimization, InferenceError, ModelRuntime, SessionOptions, TensorMap, TractEngine,
};
use inference::Tensor;

/// Single `Softmax` node over a `[1,4]` float input named `input`, output `output`.
const SOFTMAX_MODEL: &[u8] = include_bytes!("fixtures/softmax.onnx");

fn options(optimization: GraphOptimization) -> SessionOptions {
    SessionOptions {
        optimization,
        input_shape: Some(vec![1, 4]),
        ..SessionOptions::default()
    }
}

fn inputs(values: &[f32]) -> TensorMap {
    TensorMap::from([(
        "input".to_string(),
        Tensor::from_f32(&[1, 4], values).unwrap(),
    )])
}

fn assert_softmax(values: &[f32]) {
    assert_eq!(values.len(), 4);
    let sum: f32 = values.iter().sum();
    assert!((sum - 1.0).abs() < 1e-5, "sum was {}", sum);
    assert!(values.windows(2).all(|w| w[0] < w[1]));
    assert!((values[3] - 0.643_914).abs() < 1e-4, "top was {}", values[3]);
}

#[tokio::test]
async fn session_exposes_declared_names() {
    let engine = TractEngine::default();
    let session = engine
        .load(SOFTMAX_MODEL.to_vec(), &options(GraphOptimization::All))
        .await
        .unwrap();

    assert_eq!(session.input_names, vec!["input"]);
    assert_eq!(session.output_names, vec!["output"]);
    assert_eq!(session.primary_output().unwrap(), "output");
}

#[tokio::test]
async fn optimized_session_computes_softmax() {
    let engine = TractEngine::default();
    let session = engine
        .load(SOFTMAX_MODEL.to_vec(), &options(GraphOptimization::All))
        .await
        .unwrap();

    let mut outputs = engine
        .run(&session, inputs(&[1.0, 2.0, 3.0, 4.0]))
        .await
        .unwrap();

    let output = outputs.remove("output").unwrap();
    assert_eq!(output.shape, vec![1, 4]);
    assert_softmax(&output.to_f32_vec().unwrap());
}

#[tokio::test]
async fn unoptimized_session_gives_the_same_answer() {
    let engine = TractEngine::default();
    let session = engine
        .load(SOFTMAX_MODEL.to_vec(), &options(GraphOptimization::Disabled))
        .await
        .unwrap();

    let mut outputs = engine
        .run(&session, inputs(&[1.0, 2.0, 3.0, 4.0]))
        .await
        .unwrap();

    assert_softmax(&outputs.remove("output").unwrap().to_f32_vec().unwrap());
}

#[tokio::test]
async fn missing_input_tensor_is_reported_by_name() {
    let engine = TractEngine::default();
    let session = engine
        .load(SOFTMAX_MODEL.to_vec(), &options(GraphOptimization::All))
        .await
        .unwrap();

    match engine.run(&session, TensorMap::new()).await {
        Err(InferenceError::MissingInput(name)) => assert_eq!(name, "input"),
        other => panic!("unexpected result {:?}", other.map(|o| o.len())),
    }
}

#[tokio::test]
async fn dropped_session_no_longer_runs() {
    let engine = TractEngine::default();
    let first = engine
        .load(SOFTMAX_MODEL.to_vec(), &options(GraphOptimization::All))
        .await
        .unwrap();
    let second = engine
        .load(SOFTMAX_MODEL.to_vec(), &options(GraphOptimization::All))
        .await
        .unwrap();
    assert_ne!(first.graph, second.graph);

    engine.drop_session(&first).await;

    assert!(matches!(
        engine.run(&first, inputs(&[0.0; 4])).await,
        Err(InferenceError::GraphNotFound(graph)) if graph == first.graph
    ));
    assert!(engine.run(&second, inputs(&[0.0; 4])).await.is_ok());
}
