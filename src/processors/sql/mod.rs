//! Projection and filter processor.
//!
//! The processor is configured with a single-table SELECT statement. At startup the statement is
//! bound against the current schema: the projection list becomes a set of columns to drop, and
//! an optional single comparison WHERE clause becomes a row filter. At runtime both are applied
//! to every message of the bound stream, while messages of other streams pass through.
//!
//! ```sql
//! SELECT flight_id, destination FROM stream.flights WHERE flight_id > 100
//! ```

#[cfg(test)]
mod mod_test;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sqlparser::ast::{BinaryOperator, Expr, SelectItem, SetExpr, Statement, TableFactor, UnaryOperator, Value as SqlValue};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::Span;

use crate::error::AppError;
use crate::models::{CompareOp, Literal, Message, StreamDefinition, Value};
use crate::plugins::{decode_config, PluginContext, Processor};
use crate::schema::SchemaRegistry;

/// Config of the sql processor.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// The SELECT statement to apply.
    pub query: String,
}

/// A bound row filter.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: CompareOp,
    pub literal: Literal,
}

impl Filter {
    /// Check if the given message passes this filter.
    pub fn matches(&self, msg: &Message) -> Result<bool> {
        msg.get(&self.column).unwrap_or(&Value::Null).compare(self.op, &self.literal)
    }
}

/// The sql processor.
pub struct SqlProcessor {
    query: String,
    span: Span,
    /// The stream this processor is bound to.
    stream: String,
    /// Columns of the bound stream which are not selected.
    drop: Vec<String>,
    /// The bound row filter, if any.
    filter: Option<Filter>,
}

impl SqlProcessor {
    /// Create a new instance.
    pub fn new(ctx: &PluginContext, config: serde_yaml::Value) -> Result<Self> {
        let config: SqlConfig = decode_config("sql", config)?;
        if config.query.trim().is_empty() {
            bail!(AppError::Config("sql processor requires a query".into()));
        }
        Ok(Self::with_query(config.query, ctx.component_span("processor", "sql")))
    }

    /// Create a new instance for the given query.
    pub fn with_query(query: impl Into<String>, span: Span) -> Self {
        Self {
            query: query.into(),
            span,
            stream: String::new(),
            drop: vec![],
            filter: None,
        }
    }

    /// The stream this processor is bound to.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// The columns this processor drops.
    pub fn dropped_columns(&self) -> &[String] {
        &self.drop
    }

    /// The row filter of this processor.
    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }
}

#[async_trait]
impl Processor for SqlProcessor {
    fn name(&self) -> &str {
        "sql"
    }

    fn evolve_schema(&mut self, registry: &mut SchemaRegistry) -> Result<()> {
        let query = parse_query(&self.query)?;
        let current = registry.current();
        let def = current
            .get(&query.table)
            .ok_or_else(|| AppError::Schema(format!("select from undefined stream {}", query.table)))?;

        let drop = match &query.projection {
            None => vec![],
            Some(requested) => {
                let undefined: Vec<_> = requested.iter().filter(|name| def.column(name).is_none()).cloned().collect();
                if !undefined.is_empty() {
                    bail!(AppError::Schema(format!("undefined columns selection {}", undefined.join(", "))));
                }
                def.column_names().filter(|col| !requested.iter().any(|name| name == col)).map(String::from).collect()
            }
        };
        let filter = match &query.selection {
            Some(expr) => Some(bind_filter(expr, def)?),
            None => None,
        };

        if drop.is_empty() {
            registry.fake_evolve();
        } else {
            registry.remove_fields(&def.name, &drop);
        }
        tracing::debug!(parent: &self.span, stream = %def.name, ?drop, ?filter, "sql processor bound to stream");
        self.stream = def.name.clone();
        self.drop = drop;
        self.filter = filter;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn process(&self, mut msg: Message) -> Result<Option<Message>> {
        if msg.stream() != self.stream {
            return Ok(Some(msg));
        }
        // Unselected columns are dropped first, so a filter on such a column sees a null value.
        msg.drop_fields(&self.drop);
        if let Some(filter) = &self.filter {
            if !filter.matches(&msg)? {
                return Ok(None);
            }
        }
        Ok(Some(msg))
    }
}

/// The parts of a SELECT statement relevant to binding.
struct ParsedQuery {
    /// The unqualified name of the selected table.
    table: String,
    /// The selected column names, or `None` for `*`.
    projection: Option<Vec<String>>,
    selection: Option<Expr>,
}

fn parse_query(sql: &str) -> Result<ParsedQuery> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql).map_err(|err| AppError::Schema(format!("invalid query: {}", err)))?;
    if statements.len() != 1 {
        bail!(AppError::Schema("exactly one select statement expected for the stream".into()));
    }
    let select = match statements.remove(0) {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => select,
            _ => bail!(AppError::Schema("exactly one select statement expected for the stream".into())),
        },
        _ => bail!(AppError::Schema("exactly one select statement expected for the stream".into())),
    };

    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        bail!(AppError::Schema("exactly one source table expected in the select statement".into()));
    }
    let table = match &select.from[0].relation {
        TableFactor::Table { name, .. } => name.0.last().map(|ident| ident.value.clone()),
        _ => None,
    };
    let table = table.ok_or_else(|| AppError::Schema("select source must be a stream name".into()))?;

    let mut projection = Some(Vec::with_capacity(select.projection.len()));
    for item in select.projection.iter() {
        let name = match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                projection = None;
                break;
            }
            SelectItem::UnnamedExpr(expr) => column_name(expr),
            SelectItem::ExprWithAlias { expr, .. } => column_name(expr),
        };
        match (name, projection.as_mut()) {
            (Some(name), Some(names)) => names.push(name),
            (None, _) => bail!(AppError::Schema(format!("unsupported projection {}, only column names may be selected", item))),
            (Some(_), None) => (),
        }
    }

    Ok(ParsedQuery {
        table,
        projection,
        selection: select.selection.clone(),
    })
}

/// The column name referenced by the given expression, if it is a plain column reference.
fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|ident| ident.value.clone()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

/// Bind a WHERE clause against the given stream definition.
fn bind_filter(expr: &Expr, def: &StreamDefinition) -> Result<Filter> {
    let (left, op, right) = match expr {
        Expr::Nested(inner) => return bind_filter(inner, def),
        Expr::BinaryOp { left, op, right } => (left, op, right),
        _ => bail!(AppError::Schema(format!("unsupported filter {}, expected a single comparison", expr))),
    };
    let op = match op {
        BinaryOperator::Eq => CompareOp::Eq,
        BinaryOperator::NotEq => CompareOp::NotEq,
        BinaryOperator::Lt => CompareOp::Lt,
        BinaryOperator::Gt => CompareOp::Gt,
        BinaryOperator::LtEq => CompareOp::LtEq,
        BinaryOperator::GtEq => CompareOp::GtEq,
        _ => bail!(AppError::Schema(format!("unsupported filter operator {}", op))),
    };
    let column = column_name(left).ok_or_else(|| AppError::Schema(format!("filter must compare a column, got {}", left)))?;
    if def.column(&column).is_none() {
        bail!(AppError::Schema(format!("filter on undefined column {}", column)));
    }
    let literal = literal(right)?;
    Ok(Filter { column, op, literal })
}

/// Convert the given expression into a filter literal.
fn literal(expr: &Expr) -> Result<Literal> {
    match expr {
        Expr::Nested(inner) => literal(inner),
        Expr::Value(SqlValue::Number(num, _)) => number_literal(num),
        Expr::Value(SqlValue::SingleQuotedString(val)) | Expr::Value(SqlValue::DoubleQuotedString(val)) => Ok(Literal::String(val.clone())),
        Expr::Value(SqlValue::Boolean(val)) => Ok(Literal::Bool(*val)),
        Expr::UnaryOp { op: UnaryOperator::Minus, expr } => match literal(expr)? {
            Literal::Int(val) => Ok(Literal::Int(-val)),
            Literal::Float(val) => Ok(Literal::Float(-val)),
            other => bail!(AppError::Schema(format!("can not negate literal {}", other))),
        },
        _ => bail!(AppError::Schema(format!("unsupported filter literal {}", expr))),
    }
}

fn number_literal(num: &str) -> Result<Literal> {
    if let Ok(val) = num.parse::<i64>() {
        return Ok(Literal::Int(val));
    }
    match num.parse::<f64>() {
        Ok(val) => Ok(Literal::Float(val)),
        Err(_) => bail!(AppError::Schema(format!("invalid numeric literal {}", num))),
    }
}
