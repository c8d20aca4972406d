use aws_config::BehaviorVersion;
use aws_lambda_events::apigw::{ApiGatewayProxyRequest, ApiGatewayProxyResponse};
use instance_control::{Ec2ComputeProvider, InstanceControlService};
use lambda_runtime::{run, service_fn, Error, LambdaEvent};

async fn function_handler(
    service: &InstanceControlService<Ec2ComputeProvider>,
    event: LambdaEvent<ApiGatewayProxyRequest>,
) -> Result<ApiGatewayProxyResponse, Error> {
    service.handle_request(&event.payload).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let provider = Ec2ComputeProvider::new(aws_sdk_ec2::Client::new(&config));
    let secret = std::env::var("SECURESTRING").ok();

    let service = InstanceControlService::new(provider, secret);
    let service = &service;

    run(service_fn(move |event| function_handler(service, event))).await
}
