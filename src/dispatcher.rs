//! Static dispatch of resolved calls.
//!
//! At startup every `(entity, operation)` pair in the registry is bound to a
//! closure over the data source. Dispatching a call is a table lookup followed
//! by invoking that closure with the argument tree.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{QuarryError, QuarryResult};
use crate::registry::{EntityRegistry, Operation};
use crate::resolver::{Arguments, CallDescriptor};
use crate::store::{DataAccessError, DataSource};

/// Future returned by a bound operation.
pub type OperationFuture = BoxFuture<'static, Result<Value, DataAccessError>>;

/// Pre-bound handler for one `(entity, operation)` pair.
pub type BoundOperation = Arc<dyn Fn(Arguments) -> OperationFuture + Send + Sync>;

/// Lookup table from `(entity, operation)` to its handler.
#[derive(Clone, Default)]
pub struct Dispatcher {
    table: HashMap<(String, Operation), BoundOperation>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("bindings", &self.table.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every operation of every registered entity to `source`.
    pub fn bind(registry: &EntityRegistry, source: Arc<dyn DataSource>) -> Self {
        let mut dispatcher = Self::new();

        for entity in registry.entities() {
            for &operation in entity.operations() {
                let source = Arc::clone(&source);
                let name = entity.name().to_string();
                dispatcher.route(entity.name(), operation, move |arguments| {
                    let source = Arc::clone(&source);
                    let name = name.clone();
                    Box::pin(async move { source.invoke(&name, operation, arguments).await })
                });
            }
        }

        tracing::debug!("Bound {} operations", dispatcher.table.len());
        dispatcher
    }

    /// Register a handler for one pair, replacing any previous one.
    pub fn route<F>(&mut self, entity: &str, operation: Operation, handler: F) -> &mut Self
    where
        F: Fn(Arguments) -> OperationFuture + Send + Sync + 'static,
    {
        self.table
            .insert((entity.to_string(), operation), Arc::new(handler));
        self
    }

    pub fn is_bound(&self, entity: &str, operation: Operation) -> bool {
        self.table.contains_key(&(entity.to_string(), operation))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Look up the handler and start the call. Exactly one attempt is made;
    /// nothing is retried.
    pub fn prepare(&self, call: CallDescriptor) -> QuarryResult<OperationFuture> {
        let key = (call.entity().to_string(), call.operation());
        let Some(handler) = self.table.get(&key) else {
            return Err(QuarryError::UnknownOperation {
                entity: key.0,
                operation: key.1.to_string(),
                position: 0,
                suggestion: None,
            });
        };
        tracing::debug!("Dispatching {}.{}", key.0, key.1);
        Ok(handler(call.into_arguments()))
    }

    /// Dispatch and wait for the result.
    pub async fn dispatch(&self, call: CallDescriptor) -> QuarryResult<Value> {
        let future = self.prepare(call)?;
        Ok(future.await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EntitySchema, SchemaDescription};
    use crate::resolver::{Resolver, ResolverOptions};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Operation, Arguments)>>,
    }

    #[async_trait]
    impl DataSource for Recorder {
        async fn describe(&self) -> Result<SchemaDescription, DataAccessError> {
            Ok(SchemaDescription::new(vec![EntitySchema::new("User")]))
        }

        async fn invoke(
            &self,
            entity: &str,
            operation: Operation,
            arguments: Arguments,
        ) -> Result<Value, DataAccessError> {
            self.calls
                .lock()
                .unwrap()
                .push((entity.to_string(), operation, arguments));
            if operation == Operation::Delete {
                return Err(DataAccessError::new("Record to delete does not exist."));
            }
            Ok(json!([]))
        }
    }

    async fn setup() -> (Arc<Recorder>, Resolver, Dispatcher) {
        let recorder = Arc::new(Recorder::default());
        let schema = recorder.describe().await.unwrap();
        let registry = Arc::new(EntityRegistry::from_schema(&schema).unwrap());
        let dispatcher = Dispatcher::bind(&registry, recorder.clone());
        let resolver = Resolver::new(registry, ResolverOptions::default());
        (recorder, resolver, dispatcher)
    }

    #[tokio::test]
    async fn test_every_operation_is_bound() {
        let (_, _, dispatcher) = setup().await;
        assert_eq!(dispatcher.len(), Operation::ALL.len());
        assert!(dispatcher.is_bound("User", Operation::GroupBy));
        assert!(!dispatcher.is_bound("Ghost", Operation::FindMany));
    }

    #[tokio::test]
    async fn test_each_operation_invoked_once_with_empty_arguments() {
        let (recorder, resolver, dispatcher) = setup().await;

        for operation in Operation::ALL {
            let call = resolver
                .resolve(&format!("user.{}({{}})", operation.name()))
                .unwrap();
            let _ = dispatcher.dispatch(call).await;
        }

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), Operation::ALL.len());
        for (i, (entity, operation, arguments)) in calls.iter().enumerate() {
            assert_eq!(entity, "User");
            assert_eq!(*operation, Operation::ALL[i]);
            assert!(arguments.is_empty());
        }
    }

    #[tokio::test]
    async fn test_error_passes_through_verbatim() {
        let (recorder, resolver, dispatcher) = setup().await;
        let call = resolver.resolve("user.delete({ where: { id: 9 } })").unwrap();
        let err = dispatcher.dispatch(call).await.unwrap_err();
        assert_eq!(err.to_string(), "Record to delete does not exist.");
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_custom_route() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.route("User", Operation::Count, |_| Box::pin(async { Ok(json!(42)) }));

        let (_, resolver, _) = setup().await;
        let call = resolver.resolve("user.count()").unwrap();
        assert_eq!(dispatcher.dispatch(call).await.unwrap(), json!(42));

        let call = resolver.resolve("user.findMany()").unwrap();
        assert!(matches!(
            dispatcher.dispatch(call).await,
            Err(QuarryError::UnknownOperation { .. })
        ));
    }
}
