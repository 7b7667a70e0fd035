use crate::{Driver, DRIVER_NAME};
use csi_proto::v1 as csi;
use ebs_cloud::CloudProvider;
use tonic::{Request, Response, Status};
use tracing::instrument;

#[tonic::async_trait]
impl<C: CloudProvider> csi::identity_server::Identity for Driver<C> {
  #[instrument(name = "identity.get_plugin_info", skip(self, _request))]
  async fn get_plugin_info(
    &self,
    _request: Request<csi::GetPluginInfoRequest>,
  ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
    let response = csi::GetPluginInfoResponse {
      name: DRIVER_NAME.to_string(),
      vendor_version: env!("CARGO_PKG_VERSION").to_string(),
      manifest: Default::default(),
    };

    Ok(Response::new(response))
  }

  #[instrument(name = "identity.get_plugin_capabilities", skip(self, _request))]
  async fn get_plugin_capabilities(
    &self,
    _request: Request<csi::GetPluginCapabilitiesRequest>,
  ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
    use csi::plugin_capability::{service, Service, Type};

    let capabilities = [
      service::Type::ControllerService,
      service::Type::VolumeAccessibilityConstraints,
    ]
    .into_iter()
    .map(|ty| csi::PluginCapability {
      r#type: Some(Type::Service(Service { r#type: ty as i32 })),
    })
    .collect();

    Ok(Response::new(csi::GetPluginCapabilitiesResponse {
      capabilities,
    }))
  }

  #[instrument(name = "identity.probe", skip(self, _request))]
  async fn probe(
    &self,
    _request: Request<csi::ProbeRequest>,
  ) -> Result<Response<csi::ProbeResponse>, Status> {
    Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
  }
}
