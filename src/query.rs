//! Query objects and result rows.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::backend::FieldDescription;
use crate::protocol::types::{FormatCode, PgType};
use crate::value::PgValue;

/// One decoded result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    fields: Arc<[FieldDescription]>,
    values: Vec<PgValue>,
}

impl Row {
    pub(crate) fn new(fields: Arc<[FieldDescription]>, values: Vec<PgValue>) -> Self {
        Self { fields, values }
    }

    /// Column descriptors for this row.
    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a column by index.
    pub fn get(&self, index: usize) -> Option<&PgValue> {
        self.values.get(index)
    }

    /// Get a column by field name.
    pub fn get_by_name(&self, name: &str) -> Option<&PgValue> {
        let index = self.fields.iter().position(|f| f.name == name)?;
        self.values.get(index)
    }

    pub fn into_values(self) -> Vec<PgValue> {
        self.values
    }
}

impl std::ops::Index<usize> for Row {
    type Output = PgValue;

    fn index(&self, index: usize) -> &PgValue {
        &self.values[index]
    }
}

/// What a completed query resolves with.
#[derive(Debug)]
pub(crate) enum QueryOutput {
    Rows(Vec<Row>),
    Affected(u64),
}

/// A reuse-cache entry: a statement the server has parsed under `name`.
///
/// Valid only once the server's ParameterDescription confirmed the declared
/// parameter types; the field list is kept so reuse dispatches (which skip
/// Describe) can still decode rows.
#[derive(Debug, Clone)]
pub(crate) struct CachedStatement {
    pub name: String,
    pub param_types: Vec<PgType>,
    pub fields: Arc<[FieldDescription]>,
}

/// Cache insert staged on an in-flight query until the server confirms it.
#[derive(Debug)]
pub(crate) struct PendingCache {
    pub key: String,
    pub name: String,
    pub param_types: Vec<PgType>,
    pub validated: bool,
}

/// A query from enqueue to completion.
///
/// Accumulates the result while the connection is `Busy` on it and resolves
/// the caller's completion signal exactly once, after the terminating
/// ReadyForQuery (or on cancellation).
#[derive(Debug)]
pub(crate) struct Query {
    pub statement: String,
    pub params: HashMap<String, PgValue>,
    /// Use the simple-query path and resolve with the affected-row count.
    pub only_affected: bool,
    pub allow_reuse: bool,
    /// Owning transaction context, if any.
    pub tx: Option<u64>,
    /// A `BEGIN` dispatched from the main FIFO that establishes `tx`.
    pub begins_tx: bool,
    /// COMMIT/ROLLBACK: still dispatched when the transaction has failed.
    pub tx_control: bool,

    // Accumulated while in flight
    pub fields: Option<Arc<[FieldDescription]>>,
    pub rows: Vec<Row>,
    pub affected: u64,
    pub result_format: FormatCode,
    pub declared_types: Vec<PgType>,
    pub pending_cache: Option<PendingCache>,
    /// Error held back until ReadyForQuery drains the response group.
    pub failure: Option<Error>,

    reply: Option<oneshot::Sender<Result<QueryOutput>>>,
}

impl Query {
    pub fn new(
        statement: impl Into<String>,
        params: HashMap<String, PgValue>,
        only_affected: bool,
        allow_reuse: bool,
    ) -> (Box<Self>, oneshot::Receiver<Result<QueryOutput>>) {
        let (reply, completion) = oneshot::channel();
        (
            Box::new(Self {
                statement: statement.into(),
                params,
                only_affected,
                allow_reuse,
                tx: None,
                begins_tx: false,
                tx_control: false,
                fields: None,
                rows: Vec::new(),
                affected: 0,
                result_format: FormatCode::Binary,
                declared_types: Vec::new(),
                pending_cache: None,
                failure: None,
                reply: Some(reply),
            }),
            completion,
        )
    }

    /// Resolve the completion signal. Later calls are no-ops, which keeps
    /// the exactly-once contract under cancellation races.
    pub fn complete(&mut self, result: Result<QueryOutput>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.reply.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    fn fields() -> Arc<[FieldDescription]> {
        Arc::from(vec![FieldDescription {
            name: "n".into(),
            table_oid: 0,
            column_id: 0,
            type_oid: oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: FormatCode::Binary,
        }])
    }

    #[test]
    fn row_access_by_index_and_name() {
        let row = Row::new(fields(), vec![PgValue::Int4(7)]);
        assert_eq!(row.get(0), Some(&PgValue::Int4(7)));
        assert_eq!(row.get_by_name("n"), Some(&PgValue::Int4(7)));
        assert_eq!(row.get_by_name("missing"), None);
        assert_eq!(row[0], PgValue::Int4(7));
    }

    #[test]
    fn completion_resolves_exactly_once() {
        let (mut query, mut completion) = Query::new("SELECT 1", HashMap::new(), false, true);
        assert!(!query.is_completed());

        query.complete(Ok(QueryOutput::Affected(1)));
        assert!(query.is_completed());
        // Second completion is swallowed.
        query.complete(Err(Error::cancelled()));

        match completion.try_recv() {
            Ok(Ok(QueryOutput::Affected(1))) => {}
            other => panic!("unexpected completion: {other:?}"),
        }
    }
}
