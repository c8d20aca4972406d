use std::fmt;

use aws_lambda_events::apigw::{ApiGatewayProxyRequest, ApiGatewayProxyResponse};
use aws_lambda_events::encodings::Body;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::Client as Ec2Client;
use http::{header, HeaderMap, HeaderValue};
use lambda_runtime::Error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

const NAME_TAG: &str = "Name";
const TERMINATED_STATE: &str = "terminated";

// Response codes produced by the dispatcher:
// 200  action executed successfully
// 400  no action or an invalid action requested (also: request without a body)
// 401  secure string not present in the request body
// 403  secure string does not match the configured value
// 412  SECURESTRING not set in the environment
// 417  missing instance id for stop/start
// 500  EC2 rejected a stop/start request
// (502 is reserved for API Gateway misconfiguration and never produced here)

/// Body of an inbound request. All fields are optional so the guard chain can
/// report exactly which one is missing.
#[derive(Deserialize, Debug, Clone)]
pub struct ActionRequest {
    pub securestring: Option<String>,
    pub action: Option<String>,
    pub ec2id: Option<String>,
}

/// The closed set of actions a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Status,
    Stop,
    Start,
}

impl Action {
    /// Parses the wire value. Matching is case-sensitive; anything outside the
    /// three known actions is treated as "nothing to do" by the dispatcher.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "status" => Some(Self::Status),
            "stop" => Some(Self::Stop),
            "start" => Some(Self::Start),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Stop => write!(f, "stop"),
            Self::Start => write!(f, "start"),
        }
    }
}

/// One entry of the `status` response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstanceSummary {
    pub ec2id: String,
    pub ipaddress: Option<String>,
    pub state: String,
    pub name: Option<String>,
}

impl From<InstanceRecord> for InstanceSummary {
    fn from(record: InstanceRecord) -> Self {
        let name = find_tag_value(&record.tags, NAME_TAG);
        Self {
            ec2id: record.id,
            ipaddress: record.public_ip,
            state: record.state,
            name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTag {
    pub key: String,
    pub value: String,
}

/// Raw instance data as reported by the provider, before projection.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub id: String,
    pub public_ip: Option<String>,
    pub state: String,
    pub tags: Vec<InstanceTag>,
}

pub fn find_tag_value(tags: &[InstanceTag], key: &str) -> Option<String> {
    tags.iter()
        .find(|tag| tag.key == key)
        .map(|tag| tag.value.clone())
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// EC2 accepted the call but rejected the request itself (unknown id,
    /// forbidden, invalid state transition). Maps to a 500 response.
    #[error("{0}")]
    Client(String),
    /// Anything else: dispatch failure, timeout, response decoding. Never
    /// mapped to a response code; bubbles up to the Lambda runtime.
    #[error("{0}")]
    Transport(lambda_runtime::Error),
}

/// Operations the dispatcher needs from the compute provider.
///
/// Abstracted behind a trait so tests can substitute a double for the real
/// EC2 client.
#[allow(async_fn_in_trait)]
#[cfg_attr(test, mockall::automock)]
pub trait ComputeProvider: Send + Sync {
    async fn enumerate_instances(&self) -> Result<Vec<InstanceRecord>, ProviderError>;

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ProviderError>;

    async fn start_instance(&self, instance_id: &str) -> Result<(), ProviderError>;
}

/// Production provider backed by the AWS SDK EC2 client. The client is built
/// once at process start and shared across invocations.
pub struct Ec2ComputeProvider {
    client: Ec2Client,
}

impl Ec2ComputeProvider {
    pub fn new(client: Ec2Client) -> Self {
        Self { client }
    }
}

impl ComputeProvider for Ec2ComputeProvider {
    async fn enumerate_instances(&self) -> Result<Vec<InstanceRecord>, ProviderError> {
        let mut records = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .describe_instances()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(classify_sdk_error)?;

            for reservation in response.reservations() {
                for instance in reservation.instances() {
                    let Some(id) = instance.instance_id() else {
                        continue;
                    };
                    let state = instance
                        .state()
                        .and_then(|state| state.name())
                        .map(|name| name.as_str().to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    let tags = instance
                        .tags()
                        .iter()
                        .filter_map(|tag| {
                            Some(InstanceTag {
                                key: tag.key()?.to_string(),
                                value: tag.value().unwrap_or_default().to_string(),
                            })
                        })
                        .collect();

                    records.push(InstanceRecord {
                        id: id.to_string(),
                        public_ip: instance.public_ip_address().map(str::to_string),
                        state,
                        tags,
                    });
                }
            }

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(records)
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.client
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map(|_| ())
            .map_err(classify_sdk_error)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.client
            .start_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map(|_| ())
            .map_err(classify_sdk_error)
    }
}

/// Splits SDK failures into the one category the handlers report as a 500
/// (EC2-reported service errors) and everything else, which propagates.
fn classify_sdk_error<E>(err: SdkError<E>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(_) => {
            let code = err.code().unwrap_or("UnknownError");
            let message = err.message().unwrap_or("no error message from EC2");
            ProviderError::Client(format!("{code}: {message}"))
        }
        _ => ProviderError::Transport(err.into()),
    }
}

/// Request dispatcher: runs the guard chain and routes to the action
/// handlers. Holds the shared secret read from `SECURESTRING` at startup.
pub struct InstanceControlService<P> {
    provider: P,
    secret: Option<String>,
}

impl<P: ComputeProvider> InstanceControlService<P> {
    pub fn new(provider: P, secret: Option<String>) -> Self {
        Self { provider, secret }
    }

    pub async fn handle_request(
        &self,
        request: &ApiGatewayProxyRequest,
    ) -> Result<ApiGatewayProxyResponse, Error> {
        let Some(secret) = self.secret.as_deref() else {
            error!("SECURESTRING is not configured, rejecting all requests");
            return Ok(message_response(
                412,
                "Environment variable SECURESTRING not set.",
            ));
        };

        let Some(raw_body) = request.body.as_deref() else {
            return Ok(invalid_action());
        };
        let body: ActionRequest = serde_json::from_str(raw_body)?;

        let Some(provided) = body.securestring.as_deref() else {
            return Ok(message_response(
                401,
                "Necessary secure token not provided by your request.",
            ));
        };
        if !secrets_match(provided, secret) {
            warn!("secure string mismatch, rejecting request");
            return Ok(message_response(
                403,
                "You are not allowed to execute this function.",
            ));
        }

        match body.action.as_deref().and_then(Action::parse) {
            Some(Action::Status) => self.list_instances().await,
            Some(Action::Stop) => match body.ec2id.as_deref() {
                Some(ec2id) => self.stop_instance(ec2id).await,
                None => Ok(missing_instance_id()),
            },
            Some(Action::Start) => match body.ec2id.as_deref() {
                Some(ec2id) => self.start_instance(ec2id).await,
                None => Ok(missing_instance_id()),
            },
            None => Ok(invalid_action()),
        }
    }

    async fn list_instances(&self) -> Result<ApiGatewayProxyResponse, Error> {
        let records = self.provider.enumerate_instances().await?;

        // Terminated instances can't be started or stopped, so the caller
        // never sees them.
        let instances: Vec<InstanceSummary> = records
            .into_iter()
            .filter(|record| record.state != TERMINATED_STATE)
            .map(InstanceSummary::from)
            .collect();

        info!(count = instances.len(), "returning instance inventory");
        Ok(json_response(200, &json!({ "instances": instances })))
    }

    async fn stop_instance(&self, ec2id: &str) -> Result<ApiGatewayProxyResponse, Error> {
        info!(ec2id = %ec2id, "stopping instance");
        match self.provider.stop_instance(ec2id).await {
            Ok(()) => Ok(message_response(
                200,
                &format!("Instance {ec2id} successfully stopped"),
            )),
            Err(ProviderError::Client(message)) => {
                error!(ec2id = %ec2id, error = %message, "EC2 rejected the stop request");
                Ok(message_response(500, &message))
            }
            Err(ProviderError::Transport(err)) => Err(err),
        }
    }

    async fn start_instance(&self, ec2id: &str) -> Result<ApiGatewayProxyResponse, Error> {
        info!(ec2id = %ec2id, "starting instance");
        match self.provider.start_instance(ec2id).await {
            Ok(()) => Ok(message_response(
                200,
                &format!("Instance {ec2id} successfully started"),
            )),
            Err(ProviderError::Client(message)) => {
                error!(ec2id = %ec2id, error = %message, "EC2 rejected the start request");
                Ok(message_response(500, &message))
            }
            Err(ProviderError::Transport(err)) => Err(err),
        }
    }
}

/// Compares the caller-supplied secret against the configured one. The loop
/// runs over every byte so the comparison time does not depend on where the
/// two strings diverge.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    let mut diff = provided.len() ^ expected.len();
    for (a, b) in provided.iter().zip(expected.iter()) {
        diff |= usize::from(a ^ b);
    }
    diff == 0
}

fn json_response(status_code: i64, body: &serde_json::Value) -> ApiGatewayProxyResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    ApiGatewayProxyResponse {
        status_code,
        headers,
        multi_value_headers: HeaderMap::new(),
        body: Some(Body::Text(body.to_string())),
        is_base64_encoded: false,
    }
}

fn message_response(status_code: i64, message: &str) -> ApiGatewayProxyResponse {
    json_response(status_code, &json!({ "message": message }))
}

fn invalid_action() -> ApiGatewayProxyResponse {
    message_response(400, "No action or an invalid action send. Nothing to do.")
}

fn missing_instance_id() -> ApiGatewayProxyResponse {
    message_response(417, "Necessary EC2 Instance ID not provided by your request.")
}
