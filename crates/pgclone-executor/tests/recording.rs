use pgclone_executor::common::{Executor, ExecutorError};
use pgclone_executor::{ExecutorCall, ExecutorOp, RecordingExecutor};
use std::time::Duration;

#[tokio::test]
async fn records_calls_in_order() {
    let executor = RecordingExecutor::new();

    executor.create_snapshot(1).await.unwrap();
    executor.finalize_image(1).await.unwrap();
    executor.provision_instance(1, 7, 6000).await.unwrap();
    executor.teardown_instance(7).await.unwrap();

    assert_eq!(
        executor.calls().await,
        vec![
            ExecutorCall::CreateSnapshot(1),
            ExecutorCall::FinalizeImage(1),
            ExecutorCall::ProvisionInstance {
                image_id: 1,
                instance_id: 7,
                port: 6000
            },
            ExecutorCall::TeardownInstance(7),
        ]
    );
}

#[tokio::test]
async fn injected_failure_is_still_recorded() {
    let executor = RecordingExecutor::new();
    executor.fail_on(ExecutorOp::ProvisionInstance).await;

    let err = executor.provision_instance(1, 2, 6001).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Failed { .. }));
    assert_eq!(executor.count(ExecutorOp::ProvisionInstance).await, 1);

    executor.succeed_on(ExecutorOp::ProvisionInstance).await;
    executor.provision_instance(1, 3, 6002).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn provision_delay_is_observable_by_timeouts() {
    let executor = RecordingExecutor::new();
    executor
        .set_provision_delay(Some(Duration::from_secs(30)))
        .await;

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        executor.provision_instance(1, 2, 6000),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(executor.count(ExecutorOp::ProvisionInstance).await, 0);
}
