//! The kubelet-facing plugin surface: the registration service the kubelet
//! discovers in its plugin registry, and the DRA node service it calls to
//! prepare and unprepare resource claims. Claims arrive as references; the
//! driver resolves them against the API server before preparing.

use std::collections::HashMap;

use anyhow::{Context, Result};
use k8s_openapi::api::resource::v1beta1::ResourceClaim;
use kube::api::Api;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::driver::NetworkDriver;
use crate::grpc_sock;
use crate::metrics::{HookTimer, STATUS_SUCCESS};
use crate::plugin_api::dra::v1beta1 as dra_api;
use crate::plugin_api::dra::v1beta1::dra_plugin_server::{DraPlugin, DraPluginServer};
use crate::plugin_api::registration::v1 as registration_api;
use crate::plugin_api::registration::v1::registration_server::{
    Registration, RegistrationServer,
};

/// Answers the kubelet's plugin discovery probe.
struct RegistrationService {
    driver_name: String,
    endpoint: String,
}

#[tonic::async_trait]
impl Registration for RegistrationService {
    async fn get_info(
        &self,
        _request: Request<registration_api::InfoRequest>,
    ) -> Result<Response<registration_api::PluginInfo>, Status> {
        debug!(driver = %self.driver_name, "kubelet requested plugin info");
        Ok(Response::new(registration_api::PluginInfo {
            r#type: "DRAPlugin".to_string(),
            name: self.driver_name.clone(),
            endpoint: self.endpoint.clone(),
            supported_versions: vec![dra_api::API_VERSION.to_string()],
        }))
    }

    async fn notify_registration_status(
        &self,
        request: Request<registration_api::RegistrationStatus>,
    ) -> Result<Response<registration_api::RegistrationStatusResponse>, Status> {
        let status = request.into_inner();
        if status.plugin_registered {
            info!(driver = %self.driver_name, "plugin registered with kubelet");
        } else {
            warn!(
                driver = %self.driver_name,
                error = %status.error,
                "kubelet rejected plugin registration"
            );
        }
        Ok(Response::new(registration_api::RegistrationStatusResponse {}))
    }
}

struct DraService {
    driver: NetworkDriver,
    client: kube::Client,
}

impl DraService {
    /// Fetches the claim object the reference points at and verifies that
    /// the UID still matches (the claim may have been deleted and recreated
    /// under the same name).
    async fn fetch_claim(&self, reference: &dra_api::Claim) -> Result<ResourceClaim> {
        let api: Api<ResourceClaim> = Api::namespaced(self.client.clone(), &reference.namespace);
        let claim = api
            .get(&reference.name)
            .await
            .with_context(|| format!("failed to get claim {}/{}", reference.namespace, reference.name))?;
        let uid = claim.metadata.uid.as_deref().unwrap_or_default();
        if uid != reference.uid {
            anyhow::bail!(
                "claim {}/{} UID mismatch: expected {}, got {uid}",
                reference.namespace,
                reference.name,
                reference.uid
            );
        }
        Ok(claim)
    }
}

#[tonic::async_trait]
impl DraPlugin for DraService {
    async fn node_prepare_resources(
        &self,
        request: Request<dra_api::NodePrepareResourcesRequest>,
    ) -> Result<Response<dra_api::NodePrepareResourcesResponse>, Status> {
        let timer = HookTimer::dra("PrepareResourceClaims");
        let references = request.into_inner().claims;
        info!(claims = references.len(), "preparing resource claims");

        let mut claims = HashMap::new();
        for reference in &references {
            let result = match self.fetch_claim(reference).await {
                Err(err) => dra_api::NodePrepareResourceResponse {
                    devices: vec![],
                    error: format!("{err:#}"),
                },
                Ok(claim) => match self.driver.prepare_resource_claim(&claim) {
                    Err(err) => dra_api::NodePrepareResourceResponse {
                        devices: vec![],
                        error: format!("{err:#}"),
                    },
                    Ok(prepared) => dra_api::NodePrepareResourceResponse {
                        devices: prepared
                            .into_iter()
                            .map(|device| dra_api::Device {
                                request_names: device.requests,
                                pool_name: device.pool,
                                device_name: device.device,
                                cdi_device_ids: vec![],
                            })
                            .collect(),
                        error: String::new(),
                    },
                },
            };
            claims.insert(reference.uid.clone(), result);
        }
        timer.observe(STATUS_SUCCESS);
        Ok(Response::new(dra_api::NodePrepareResourcesResponse {
            claims,
        }))
    }

    async fn node_unprepare_resources(
        &self,
        request: Request<dra_api::NodeUnprepareResourcesRequest>,
    ) -> Result<Response<dra_api::NodeUnprepareResourcesResponse>, Status> {
        let timer = HookTimer::dra("UnprepareResourceClaims");
        let references = request.into_inner().claims;
        info!(claims = references.len(), "unpreparing resource claims");

        let mut claims = HashMap::new();
        for reference in &references {
            let error = match self
                .driver
                .unprepare_resource_claim(&reference.namespace, &reference.name)
            {
                Ok(()) => String::new(),
                Err(err) => {
                    warn!(
                        claim = %format!("{}/{}", reference.namespace, reference.name),
                        error = %err,
                        "error unpreparing claim"
                    );
                    format!("{err:#}")
                }
            };
            claims.insert(
                reference.uid.clone(),
                dra_api::NodeUnprepareResourceResponse { error },
            );
        }
        timer.observe(STATUS_SUCCESS);
        Ok(Response::new(dra_api::NodeUnprepareResourcesResponse {
            claims,
        }))
    }
}

/// Serves the registration socket and the DRA service socket. Both servers
/// run until shutdown; failure to bind either socket is fatal for startup.
pub async fn serve(
    driver: NetworkDriver,
    client: kube::Client,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let config = driver.config();
    let dra_socket_path = config.dra_socket();
    let registration_socket_path = config.registration_socket();

    let dra_socket = grpc_sock::server::Socket::new(&dra_socket_path)
        .with_context(|| format!("failed to open DRA socket {}", dra_socket_path.display()))?;
    let registration_socket = grpc_sock::server::Socket::new(&registration_socket_path)
        .with_context(|| {
            format!(
                "failed to open registration socket {}",
                registration_socket_path.display()
            )
        })?;
    info!(
        dra = %dra_socket_path.display(),
        registration = %registration_socket_path.display(),
        "serving kubelet plugin sockets"
    );

    let registration = RegistrationService {
        driver_name: config.driver_name.clone(),
        endpoint: dra_socket_path.to_string_lossy().to_string(),
    };
    let dra = DraService { driver, client };

    let mut dra_shutdown = shutdown.clone();
    let mut registration_shutdown = shutdown;
    let task = tokio::spawn(async move {
        let dra_server = tonic::transport::Server::builder()
            .add_service(DraPluginServer::new(dra))
            .serve_with_incoming_shutdown(dra_socket, async move {
                let _ = dra_shutdown.changed().await;
            });
        let registration_server = tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(registration))
            .serve_with_incoming_shutdown(registration_socket, async move {
                let _ = registration_shutdown.changed().await;
            });
        let (dra_result, registration_result) = tokio::join!(dra_server, registration_server);
        if let Err(err) = dra_result {
            warn!(error = %err, "DRA plugin server failed");
        }
        if let Err(err) = registration_result {
            warn!(error = %err, "registration server failed");
        }
    });
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc_sock::client::socket_channel;
    use crate::plugin_api::registration::v1::registration_client::RegistrationClient;
    use tokio::sync::watch;

    /// A client pointing at an unreachable API server; the registration
    /// path never talks to it.
    fn mock_client() -> kube::Client {
        kube::Client::try_from(kube::Config::new("http://127.0.0.1:8080".parse().unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn kubelet_discovers_the_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _effector) = crate::driver::tests::test_driver(tmp.path());
        let registration_socket = driver.config().registration_socket();
        let dra_socket = driver.config().dra_socket();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = serve(driver, mock_client(), shutdown_rx).await.unwrap();

        let channel = socket_channel(&registration_socket).await.unwrap();
        let mut client = RegistrationClient::new(channel);
        let info = client
            .get_info(registration_api::InfoRequest {})
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.r#type, "DRAPlugin");
        assert_eq!(info.name, crate::config::DEFAULT_DRIVER_NAME);
        assert_eq!(info.endpoint, dra_socket.to_string_lossy());
        assert_eq!(info.supported_versions, vec!["v1beta1"]);

        client
            .notify_registration_status(registration_api::RegistrationStatus {
                plugin_registered: true,
                error: String::new(),
            })
            .await
            .unwrap();

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
