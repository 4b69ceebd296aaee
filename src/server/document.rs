use async_graphql::parser::parse_query;
use async_graphql::parser::types::{DocumentOperations, OperationDefinition, OperationType, Selection};

use crate::models::GraphQLError;
use crate::protocol::SubscribePayload;

// Root field a subscription document selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub field_name: String,
    pub response_key: String,
}

// Parses the client's document and finds the single root field of its subscription
// operation. Errors are reported to the client against the subscription id.
pub fn analyze_subscription(payload: &SubscribePayload) -> Result<SubscriptionTarget, GraphQLError> {
    let document = parse_query(&payload.query)
        .map_err(|e| GraphQLError::new(e.to_string()).with_code("GRAPHQL_PARSE_FAILED"))?;

    let operation = select_operation(&document.operations, payload.operation_name.as_deref())?;
    let kind = match operation.ty {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    };
    if operation.ty != OperationType::Subscription {
        return Err(GraphQLError::new(format!(
            "Only subscription operations can be sent over this connection, found a {} operation",
            kind
        ))
        .with_code("BAD_OPERATION"));
    }

    let mut fields = Vec::new();
    for selection in &operation.selection_set.node.items {
        match &selection.node {
            Selection::Field(field) => fields.push(&field.node),
            _ => {
                return Err(GraphQLError::new("Fragments are not supported on the subscription root")
                    .with_code("GRAPHQL_VALIDATION_FAILED"))
            }
        }
    }

    match fields.as_slice() {
        [field] => Ok(SubscriptionTarget {
            field_name: field.name.node.to_string(),
            response_key: field
                .alias
                .as_ref()
                .map(|alias| alias.node.to_string())
                .unwrap_or_else(|| field.name.node.to_string()),
        }),
        _ => Err(GraphQLError::new(format!(
            "A subscription must select exactly one root field, found {}",
            fields.len()
        ))
        .with_code("GRAPHQL_VALIDATION_FAILED")),
    }
}

fn select_operation<'a>(
    operations: &'a DocumentOperations,
    operation_name: Option<&str>,
) -> Result<&'a OperationDefinition, GraphQLError> {
    match operations {
        DocumentOperations::Single(operation) => Ok(&operation.node),
        DocumentOperations::Multiple(named) => {
            let found = match operation_name {
                Some(wanted) => named
                    .iter()
                    .find(|(name, _)| name.as_str() == wanted)
                    .map(|(_, operation)| &operation.node),
                None if named.len() == 1 => named.values().next().map(|operation| &operation.node),
                None => {
                    return Err(GraphQLError::new("An operation name is required when the document has several operations")
                        .with_code("BAD_OPERATION"))
                }
            };
            found.ok_or_else(|| {
                GraphQLError::new(format!("Unknown operation named '{}'", operation_name.unwrap_or_default()))
                    .with_code("BAD_OPERATION")
            })
        }
    }
}
