//! The container runtime event service. The runtime's plugin adapter
//! connects to the driver's socket and reports sandbox and container
//! lifecycle transitions; each hook is timed and counted before it is
//! delegated to the driver.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::driver::{HookOutcome, NetworkDriver};
use crate::grpc_sock;
use crate::metrics::{HookTimer, STATUS_FAILED, STATUS_NOOP, STATUS_SUCCESS};
use crate::plugin_api::runtime::v1::runtime_plugin_server::{RuntimePlugin, RuntimePluginServer};
use crate::plugin_api::runtime::v1::{
    CreateContainerRequest, CreateContainerResponse, Empty, RemovePodSandboxRequest,
    RunPodSandboxRequest, StopPodSandboxRequest, SynchronizeRequest, SynchronizeResponse,
};

fn outcome_status(outcome: HookOutcome) -> &'static str {
    match outcome {
        HookOutcome::Done => STATUS_SUCCESS,
        HookOutcome::Noop => STATUS_NOOP,
    }
}

struct RuntimeService {
    driver: NetworkDriver,
}

#[tonic::async_trait]
impl RuntimePlugin for RuntimeService {
    async fn synchronize(
        &self,
        request: Request<SynchronizeRequest>,
    ) -> Result<Response<SynchronizeResponse>, Status> {
        let timer = HookTimer::runtime("Synchronize");
        let outcome = self.driver.synchronize(&request.into_inner().pods);
        timer.observe(outcome_status(outcome));
        Ok(Response::new(SynchronizeResponse {}))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<Empty>, Status> {
        let timer = HookTimer::runtime("RunPodSandbox");
        let pod = request
            .into_inner()
            .pod
            .ok_or_else(|| Status::invalid_argument("request has no pod"))?;
        match self.driver.run_pod_sandbox(&pod).await {
            Ok(outcome) => {
                timer.observe(outcome_status(outcome));
                Ok(Response::new(Empty {}))
            }
            Err(err) => {
                timer.observe(STATUS_FAILED);
                Err(Status::internal(format!("{err:#}")))
            }
        }
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<Empty>, Status> {
        let timer = HookTimer::runtime("StopPodSandbox");
        let pod = request
            .into_inner()
            .pod
            .ok_or_else(|| Status::invalid_argument("request has no pod"))?;
        match self.driver.stop_pod_sandbox(&pod).await {
            Ok(outcome) => {
                timer.observe(outcome_status(outcome));
                Ok(Response::new(Empty {}))
            }
            Err(err) => {
                timer.observe(STATUS_FAILED);
                Err(Status::internal(format!("{err:#}")))
            }
        }
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<Empty>, Status> {
        let timer = HookTimer::runtime("RemovePodSandbox");
        let pod = request
            .into_inner()
            .pod
            .ok_or_else(|| Status::invalid_argument("request has no pod"))?;
        let outcome = self.driver.remove_pod_sandbox(&pod);
        timer.observe(outcome_status(outcome));
        Ok(Response::new(Empty {}))
    }

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let timer = HookTimer::runtime("CreateContainer");
        let request = request.into_inner();
        let pod = request
            .pod
            .ok_or_else(|| Status::invalid_argument("request has no pod"))?;
        let container = request
            .container
            .ok_or_else(|| Status::invalid_argument("request has no container"))?;
        let adjust = self.driver.create_container(&pod, &container);
        timer.observe(if adjust.is_some() {
            STATUS_SUCCESS
        } else {
            STATUS_NOOP
        });
        Ok(Response::new(CreateContainerResponse { adjust }))
    }
}

/// Serves the runtime event contract on the configured unix socket until
/// shutdown is signalled.
pub async fn serve(
    driver: NetworkDriver,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let socket_path = driver.config().runtime_socket.clone();
    let socket = grpc_sock::server::Socket::new(&socket_path)
        .with_context(|| format!("failed to open runtime socket {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "serving runtime events");

    let service = RuntimeService { driver };
    let task = tokio::spawn(async move {
        let server = tonic::transport::Server::builder()
            .add_service(RuntimePluginServer::new(service))
            .serve_with_incoming_shutdown(socket, async move {
                let _ = shutdown.changed().await;
            });
        if let Err(err) = server.await {
            warn!(error = %err, "runtime event server failed");
        }
    });
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc_sock::client::socket_channel;
    use crate::plugin_api::runtime::v1::runtime_plugin_client::RuntimePluginClient;
    use crate::plugin_api::runtime::v1::{self as runtime_api};
    use tokio::sync::watch;

    fn sandbox(uid: &str) -> runtime_api::PodSandbox {
        runtime_api::PodSandbox {
            id: format!("sandbox-{uid}"),
            name: "test-pod".to_string(),
            namespace: "test-ns".to_string(),
            uid: uid.to_string(),
            linux: Some(runtime_api::LinuxPodSandbox { namespaces: vec![] }),
            ips: vec![],
        }
    }

    #[tokio::test]
    async fn create_container_round_trip_over_the_socket() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, _effector) = crate::driver::tests::test_driver(tmp.path());
        driver
            .prepare_resource_claim(&crate::claims::tests::claim_fixture(
                "uid-1",
                "claim-a",
                "pod-1",
                "net1-0000-8a-00-0",
                None,
            ))
            .unwrap();

        let socket_path = driver.config().runtime_socket.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = serve(driver, shutdown_rx).await.unwrap();

        let channel = socket_channel(&socket_path).await.unwrap();
        let mut client = RuntimePluginClient::new(channel);

        // No character devices were prepared, so the adjustment is empty.
        let response = client
            .create_container(runtime_api::CreateContainerRequest {
                pod: Some(sandbox("pod-1")),
                container: Some(runtime_api::Container {
                    id: "ctr-1".to_string(),
                    pod_sandbox_id: "sandbox-pod-1".to_string(),
                    name: "test-container".to_string(),
                }),
            })
            .await
            .unwrap()
            .into_inner();
        assert!(response.adjust.is_none());

        // Remove drains the pod, a second remove finds nothing.
        client
            .remove_pod_sandbox(runtime_api::RemovePodSandboxRequest {
                pod: Some(sandbox("pod-1")),
            })
            .await
            .unwrap();

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn run_pod_sandbox_requires_a_pod() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _effector) = crate::driver::tests::test_driver(tmp.path());
        let socket_path = driver.config().runtime_socket.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = serve(driver, shutdown_rx).await.unwrap();

        let channel = socket_channel(&socket_path).await.unwrap();
        let mut client = RuntimePluginClient::new(channel);
        let status = client
            .run_pod_sandbox(runtime_api::RunPodSandboxRequest { pod: None })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
