use std::sync::Arc;

use crate::schema::ReportingSchema;

struct ServerStateInner {
    schema: ReportingSchema,
}

#[derive(Clone)]
pub(super) struct ServerState {
    inner: Arc<ServerStateInner>,
}

impl ServerState {
    pub(super) fn new(schema: ReportingSchema) -> Self {
        Self {
            inner: Arc::new(ServerStateInner { schema }),
        }
    }

    pub(super) fn schema(&self) -> &ReportingSchema {
        &self.inner.schema
    }
}
