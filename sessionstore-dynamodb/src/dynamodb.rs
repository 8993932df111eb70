//! Amazon DynamoDB backend.
//!
//! ```no_run
//! use sessionstore_dynamodb::dynamodb::DynamoDbTable;
//!
//! # async fn example() {
//! // Region and credentials from the standard AWS environment, or DynamoDB Local:
//! let table = DynamoDbTable::connect(None, Some("http://localhost:8000".into())).await;
//! # }
//! ```

use crate::error::BackendError;
use crate::table::{
    AttrValue, BatchDelete, BatchDeleteOutput, Condition, DeleteItem, GetItem, Item, PutItem,
    ReturnValues, Scan, ScanOutput, SessionTable, UpdateItem,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeValue, DeleteRequest, ReturnValue, ReturnValuesOnConditionCheckFailure, WriteRequest,
};
use std::collections::HashMap;
use tracing::{debug, info};

type SdkItem = HashMap<String, AttributeValue>;

/// [`SessionTable`] over an `aws_sdk_dynamodb::Client`.
#[derive(Clone)]
pub struct DynamoDbTable {
    client: Client,
}

impl DynamoDbTable {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS configuration chain.
    ///
    /// `region` and `endpoint_url` override what the environment provides.
    pub async fn connect(region: Option<String>, endpoint_url: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        info!(region = ?sdk_config.region(), "DynamoDB session table client initialized");
        Self::new(Client::new(&sdk_config))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SessionTable for DynamoDbTable {
    async fn get_item(&self, request: GetItem) -> Result<Option<Item>, BackendError> {
        let mut expr = Expression::default();
        let projection = expr.projection(&request.projection);

        let output = self
            .client
            .get_item()
            .table_name(request.table_name)
            .set_key(Some(to_sdk_item(request.key)))
            .consistent_read(request.consistent_read)
            .set_projection_expression(projection)
            .set_expression_attribute_names(expr.names())
            .send()
            .await
            .map_err(backend_error)?;

        output.item.map(from_sdk_item).transpose()
    }

    async fn put_item(&self, request: PutItem) -> Result<(), BackendError> {
        let mut expr = Expression::default();
        let condition = request.condition.as_ref().map(|c| expr.condition(c));

        self.client
            .put_item()
            .table_name(request.table_name)
            .set_item(Some(to_sdk_item(request.item)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn update_item(&self, request: UpdateItem) -> Result<Option<Item>, BackendError> {
        let mut expr = Expression::default();
        let update = expr.update(&request.set, &request.remove);
        let condition = request.condition.as_ref().map(|c| expr.condition(c));
        let return_values = match request.return_values {
            ReturnValues::None => ReturnValue::None,
            ReturnValues::AllOld => ReturnValue::AllOld,
        };
        let on_failure = request
            .return_current_on_failure
            .then_some(ReturnValuesOnConditionCheckFailure::AllOld);

        let output = self
            .client
            .update_item()
            .table_name(request.table_name)
            .set_key(Some(to_sdk_item(request.key)))
            .update_expression(update)
            .set_condition_expression(condition)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .return_values(return_values)
            .set_return_values_on_condition_check_failure(on_failure)
            .send()
            .await
            .map_err(update_item_error)?;

        output.attributes.map(from_sdk_item).transpose()
    }

    async fn delete_item(&self, request: DeleteItem) -> Result<(), BackendError> {
        self.client
            .delete_item()
            .table_name(request.table_name)
            .set_key(Some(to_sdk_item(request.key)))
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn scan(&self, request: Scan) -> Result<ScanOutput, BackendError> {
        let mut expr = Expression::default();
        let projection = expr.projection(&request.projection);
        let filter = request.filter.as_ref().map(|c| expr.condition(c));
        let limit = request
            .limit
            .map(|l| i32::try_from(l).unwrap_or(i32::MAX));

        let output = self
            .client
            .scan()
            .table_name(request.table_name)
            .set_projection_expression(projection)
            .set_filter_expression(filter)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .set_limit(limit)
            .set_exclusive_start_key(request.exclusive_start_key.map(to_sdk_item))
            .send()
            .await
            .map_err(backend_error)?;

        let items = output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(from_sdk_item)
            .collect::<Result<Vec<_>, _>>()?;
        let last_evaluated_key = output
            .last_evaluated_key
            .filter(|key| !key.is_empty())
            .map(from_sdk_item)
            .transpose()?;

        debug!(
            items = items.len(),
            scanned = output.scanned_count,
            "DynamoDB scan page"
        );
        Ok(ScanOutput {
            items,
            last_evaluated_key,
        })
    }

    async fn batch_delete(&self, request: BatchDelete) -> Result<BatchDeleteOutput, BackendError> {
        let writes = request
            .keys
            .into_iter()
            .map(|key| {
                let delete = DeleteRequest::builder()
                    .set_key(Some(to_sdk_item(key)))
                    .build()
                    .map_err(|e| BackendError::service("ValidationException", e.to_string()))?;
                Ok(WriteRequest::builder().delete_request(delete).build())
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(request.table_name, writes)
            .send()
            .await
            .map_err(backend_error)?;

        let unprocessed = output
            .unprocessed_items
            .unwrap_or_default()
            .into_values()
            .flatten()
            .filter_map(|write| write.delete_request.map(|delete| delete.key))
            .map(from_sdk_item)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BatchDeleteOutput { unprocessed })
    }
}

/// Placeholder names and values for one request's expressions.
#[derive(Debug, Default)]
struct Expression {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl Expression {
    fn name(&mut self, attribute: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, name)| *name == attribute) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    fn value(&mut self, value: &AttrValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), to_sdk_value(value.clone()));
        placeholder
    }

    fn condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::AttributeExists(name) => format!("attribute_exists({})", self.name(name)),
            Condition::AttributeNotExists(name) => {
                format!("attribute_not_exists({})", self.name(name))
            }
            Condition::Equals(name, value) => {
                format!("{} = {}", self.name(name), self.value(value))
            }
            Condition::LessThan(name, value) => {
                format!("{} < {}", self.name(name), self.value(value))
            }
            Condition::And(a, b) => format!("({}) AND ({})", self.condition(a), self.condition(b)),
            Condition::Or(a, b) => format!("({}) OR ({})", self.condition(a), self.condition(b)),
        }
    }

    fn update(&mut self, set: &[(String, AttrValue)], remove: &[String]) -> String {
        let mut clauses = Vec::new();
        if !set.is_empty() {
            let assignments: Vec<String> = set
                .iter()
                .map(|(name, value)| format!("{} = {}", self.name(name), self.value(value)))
                .collect();
            clauses.push(format!("SET {}", assignments.join(", ")));
        }
        if !remove.is_empty() {
            let names: Vec<String> = remove.iter().map(|name| self.name(name)).collect();
            clauses.push(format!("REMOVE {}", names.join(", ")));
        }
        clauses.join(" ")
    }

    fn projection(&mut self, attributes: &[String]) -> Option<String> {
        if attributes.is_empty() {
            return None;
        }
        let names: Vec<String> = attributes.iter().map(|name| self.name(name)).collect();
        Some(names.join(", "))
    }

    // DynamoDB rejects empty placeholder maps.
    fn names(&self) -> Option<HashMap<String, String>> {
        (!self.names.is_empty()).then(|| self.names.clone())
    }

    fn values(&self) -> Option<HashMap<String, AttributeValue>> {
        (!self.values.is_empty()).then(|| self.values.clone())
    }
}

fn to_sdk_value(value: AttrValue) -> AttributeValue {
    match value {
        AttrValue::S(s) => AttributeValue::S(s),
        AttrValue::N(n) => AttributeValue::N(n.to_string()),
        AttrValue::B(b) => AttributeValue::B(Blob::new(b)),
    }
}

fn from_sdk_value(name: &str, value: AttributeValue) -> Result<AttrValue, BackendError> {
    match value {
        AttributeValue::S(s) => Ok(AttrValue::S(s)),
        AttributeValue::N(n) => n.parse().map(AttrValue::N).map_err(|_| {
            BackendError::service("InvalidAttribute", format!("'{}' is not a number: {}", name, n))
        }),
        AttributeValue::B(b) => Ok(AttrValue::B(b.into_inner())),
        other => Err(BackendError::service(
            "InvalidAttribute",
            format!("unsupported type for '{}': {:?}", name, other),
        )),
    }
}

fn to_sdk_item(item: Item) -> SdkItem {
    item.into_iter()
        .map(|(name, value)| (name, to_sdk_value(value)))
        .collect()
}

fn from_sdk_item(item: SdkItem) -> Result<Item, BackendError> {
    item.into_iter()
        .map(|(name, value)| {
            let value = from_sdk_value(&name, value)?;
            Ok((name, value))
        })
        .collect()
}

/// Like [`backend_error`], but keeps the item DynamoDB returns with a failed
/// condition so a busy lock can be told from a missing record.
fn update_item_error<R>(err: SdkError<UpdateItemError, R>) -> BackendError
where
    R: std::fmt::Debug,
{
    if let Some(UpdateItemError::ConditionalCheckFailedException(failed)) = err.as_service_error() {
        return match failed.item().cloned().map(from_sdk_item).transpose() {
            Ok(current) => BackendError::ConditionalCheckFailed { current },
            Err(e) => e,
        };
    }
    backend_error(err)
}

fn backend_error<E, R>(err: SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let context = DisplayErrorContext(&err).to_string();
    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return BackendError::Unavailable(context);
    }

    let message = err.message().map(str::to_string).unwrap_or(context);
    match err.code() {
        Some("ConditionalCheckFailedException") => {
            BackendError::ConditionalCheckFailed { current: None }
        }
        Some("ResourceNotFoundException") => BackendError::ResourceNotFound(message),
        Some(
            "ProvisionedThroughputExceededException" | "ThrottlingException"
            | "RequestLimitExceeded",
        ) => BackendError::Throttled(message),
        Some(code) => BackendError::service(code, message),
        None => BackendError::service("Unknown", message),
    }
}
