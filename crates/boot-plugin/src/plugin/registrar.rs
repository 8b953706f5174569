//! Service registration.
//!
//! Attaches the business service, a health responder and a reflection
//! responder to one tonic router. Registration must finish before the
//! handshake: a parent that connects earlier gets "method not found" for
//! services that are not attached yet.

use tonic::server::NamedService;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Request/response body type for services the router accepts.
pub type BoxBody = tonic::body::BoxBody;

/// Bounds tonic places on a routable service.
pub trait GrpcService:
    tonic::codegen::Service<
        http::Request<BoxBody>,
        Response = http::Response<BoxBody>,
        Error = std::convert::Infallible,
    > + NamedService
    + Clone
    + Send
    + 'static
{
}

impl<S> GrpcService for S
where
    S: tonic::codegen::Service<
            http::Request<BoxBody>,
            Response = http::Response<BoxBody>,
            Error = std::convert::Infallible,
        > + NamedService
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
}

/// Name of the health service as seen by reflection and health checks.
pub const HEALTH_SERVICE_NAME: &str = "grpc.health.v1.Health";

/// Name of the v1 reflection service.
pub const REFLECTION_SERVICE_NAME: &str = "grpc.reflection.v1.ServerReflection";

/// Name of the v1alpha reflection service, still the only one older
/// grpcurl, grpcui and Evans releases speak.
pub const REFLECTION_V1ALPHA_SERVICE_NAME: &str = "grpc.reflection.v1alpha.ServerReflection";

/// A fully registered router, ready to serve.
pub struct Registered {
    pub router: Router,
    pub health: HealthReporter,
    /// Business service first, then health and both reflection versions.
    pub services: Vec<&'static str>,
}

/// Attach `service` plus the health and reflection responders.
///
/// `descriptors` are the encoded file-descriptor sets for `service`; they
/// feed both reflection responders (v1 and v1alpha). The health descriptor
/// is added here. Overall health (`""`) and the business service's own entry are SERVING
/// when this returns.
pub async fn register<S>(
    mut server: Server,
    service: S,
    descriptors: &[&'static [u8]],
) -> Result<Registered>
where
    S: GrpcService,
    S::Future: Send + 'static,
{
    let reflection = reflection_builder(descriptors)
        .build_v1()
        .map_err(|e| Error::Registration(format!("reflection service: {}", e)))?;
    let reflection_v1alpha = reflection_builder(descriptors)
        .build_v1alpha()
        .map_err(|e| Error::Registration(format!("v1alpha reflection service: {}", e)))?;

    let (mut health, health_service) = tonic_health::server::health_reporter();
    health
        .set_service_status("", ServingStatus::Serving)
        .await;
    health.set_serving::<S>().await;

    let router = server
        .add_service(service)
        .add_service(health_service)
        .add_service(reflection)
        .add_service(reflection_v1alpha);

    let services = vec![
        S::NAME,
        HEALTH_SERVICE_NAME,
        REFLECTION_SERVICE_NAME,
        REFLECTION_V1ALPHA_SERVICE_NAME,
    ];
    for name in &services {
        debug!("Registered {}", name);
    }
    info!("Registered {} services", services.len());

    Ok(Registered {
        router,
        health,
        services,
    })
}

fn reflection_builder<'b>(descriptors: &[&'b [u8]]) -> tonic_reflection::server::Builder<'b> {
    let mut builder = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET);
    for descriptor in descriptors {
        builder = builder.register_encoded_file_descriptor_set(*descriptor);
    }
    builder
}

/// Flip overall and per-service health to NOT_SERVING.
pub async fn mark_not_serving(health: &mut HealthReporter, services: &[&'static str]) {
    health
        .set_service_status("", ServingStatus::NotServing)
        .await;
    for name in services {
        if !is_infrastructure(name) {
            health
                .set_service_status(*name, ServingStatus::NotServing)
                .await;
        }
    }
}

/// Health and reflection keep no health entry of their own.
fn is_infrastructure(name: &str) -> bool {
    [
        HEALTH_SERVICE_NAME,
        REFLECTION_SERVICE_NAME,
        REFLECTION_V1ALPHA_SERVICE_NAME,
    ]
    .contains(&name)
}
