use anyhow::{Context, Result};
use tracing::Span;

use super::*;
use crate::models::{Column, EventKind, Field, LogicalType};

fn registry() -> SchemaRegistry {
    SchemaRegistry::new(
        vec![
            StreamDefinition::new(
                "flights",
                vec![
                    Column::new("flight_id", LogicalType::Int).primary_key(),
                    Column::new("destination", LogicalType::String),
                    Column::new("price", LogicalType::Float),
                ],
            ),
            StreamDefinition::new("airports", vec![Column::new("code", LogicalType::String).primary_key()]),
        ],
        Span::none(),
    )
}

fn bound(query: &str) -> Result<(SqlProcessor, SchemaRegistry)> {
    let mut registry = registry();
    let mut processor = SqlProcessor::with_query(query, Span::none());
    processor.evolve_schema(&mut registry)?;
    Ok((processor, registry))
}

fn schema_err_msg(res: Result<()>) -> Result<String> {
    let err = res.err().context("expected a schema error")?;
    match err.downcast_ref::<AppError>() {
        Some(AppError::Schema(msg)) => Ok(msg.clone()),
        _ => anyhow::bail!("unexpected error returned {:?}", err),
    }
}

fn flight(id: i64, destination: &str) -> Message {
    Message::new(
        "flights",
        EventKind::Insert,
        vec![Field::new("flight_id", id), Field::new("destination", destination), Field::new("price", 99.5)],
    )
}

#[test]
fn projection_removes_unselected_columns() -> Result<()> {
    let (processor, registry) = bound("SELECT destination FROM stream.flights")?;

    let current = registry.current();
    let columns: Vec<_> = current.get("flights").map(|def| def.column_names().collect()).unwrap_or_default();
    assert!(columns == vec!["destination"], "expected only destination to remain, got {:?}", columns);
    assert!(current.version() == 1, "expected exactly one version bump, got {}", current.version());
    assert!(processor.stream() == "flights", "unexpected bound stream {}", processor.stream());
    assert!(processor.dropped_columns() == ["flight_id", "price"], "unexpected dropped columns {:?}", processor.dropped_columns());
    Ok(())
}

#[test]
fn wildcard_declares_no_change() -> Result<()> {
    let before = registry().current();
    let (processor, registry) = bound("SELECT * FROM flights")?;

    let after = registry.current();
    assert!(after.version() == 1, "expected version bump for wildcard projection, got {}", after.version());
    assert!(
        before.streams().collect::<Vec<_>>() == after.streams().collect::<Vec<_>>(),
        "expected schema content to be unchanged"
    );
    assert!(processor.dropped_columns().is_empty(), "expected no dropped columns, got {:?}", processor.dropped_columns());
    Ok(())
}

#[test]
fn undefined_stream_is_schema_error() -> Result<()> {
    let mut processor = SqlProcessor::with_query("SELECT destination FROM stream.flights_typo", Span::none());

    let msg = schema_err_msg(processor.evolve_schema(&mut registry()))?;

    assert!(msg.contains("select from undefined stream"), "unexpected error message {}", msg);
    Ok(())
}

#[test]
fn undefined_columns_are_schema_error() -> Result<()> {
    let mut processor = SqlProcessor::with_query("SELECT destination, gate, terminal FROM flights", Span::none());

    let msg = schema_err_msg(processor.evolve_schema(&mut registry()))?;

    assert!(msg == "undefined columns selection gate, terminal", "unexpected error message {}", msg);
    Ok(())
}

#[test]
fn multiple_statements_and_joins_are_schema_errors() -> Result<()> {
    let mut multi = SqlProcessor::with_query("SELECT * FROM flights; SELECT * FROM airports", Span::none());
    let mut join = SqlProcessor::with_query("SELECT * FROM flights JOIN airports ON flights.destination = airports.code", Span::none());
    let mut tables = SqlProcessor::with_query("SELECT * FROM flights, airports", Span::none());

    let multi_msg = schema_err_msg(multi.evolve_schema(&mut registry()))?;
    let join_msg = schema_err_msg(join.evolve_schema(&mut registry()))?;
    let tables_msg = schema_err_msg(tables.evolve_schema(&mut registry()))?;

    assert!(multi_msg == "exactly one select statement expected for the stream", "unexpected error message {}", multi_msg);
    assert!(join_msg.contains("exactly one source table"), "unexpected error message {}", join_msg);
    assert!(tables_msg.contains("exactly one source table"), "unexpected error message {}", tables_msg);
    Ok(())
}

#[test]
fn filter_on_undefined_column_is_schema_error() -> Result<()> {
    let mut processor = SqlProcessor::with_query("SELECT * FROM flights WHERE gate = 'B12'", Span::none());

    let msg = schema_err_msg(processor.evolve_schema(&mut registry()))?;

    assert!(msg.contains("gate"), "expected error to name the column, got {}", msg);
    Ok(())
}

#[test]
fn filter_literals_are_typed() -> Result<()> {
    let cases = vec![
        ("SELECT * FROM flights WHERE flight_id = 123", CompareOp::Eq, Literal::Int(123)),
        ("SELECT * FROM flights WHERE price >= 10.5", CompareOp::GtEq, Literal::Float(10.5)),
        ("SELECT * FROM flights WHERE flight_id > -5", CompareOp::Gt, Literal::Int(-5)),
        ("SELECT * FROM flights WHERE destination != 'SFO'", CompareOp::NotEq, Literal::String("SFO".into())),
        ("SELECT * FROM flights WHERE destination <> 'SFO'", CompareOp::NotEq, Literal::String("SFO".into())),
    ];
    for (query, op, literal) in cases {
        let (processor, _) = bound(query)?;
        let filter = processor.filter().cloned();
        assert!(
            matches!(&filter, Some(f) if f.op == op && f.literal == literal),
            "unexpected filter for query {}: {:?}",
            query,
            filter
        );
    }
    Ok(())
}

#[tokio::test]
async fn filter_keeps_matching_and_drops_mismatching_rows() -> Result<()> {
    let (processor, _) = bound("SELECT * FROM flights WHERE flight_id = 123")?;
    let matching = flight(123, "SFO");

    let kept = processor.process(matching.clone()).await?;
    let dropped = processor.process(flight(124, "SFO")).await?;

    assert!(kept.as_ref() == Some(&matching), "expected matching message unchanged, got {:?}", kept);
    assert!(dropped.is_none(), "expected mismatching message to be dropped, got {:?}", dropped);
    Ok(())
}

#[tokio::test]
async fn process_drops_unselected_columns() -> Result<()> {
    let (processor, _) = bound("SELECT destination FROM flights WHERE destination = 'SFO'")?;

    let out = processor.process(flight(123, "SFO")).await?.context("expected message to pass the filter")?;

    let names: Vec<_> = out.fields().iter().map(|field| field.name.as_str()).collect();
    assert!(names == vec!["destination"], "unexpected fields {:?}", names);
    Ok(())
}

#[tokio::test]
async fn filter_on_unselected_column_sees_dropped_value() -> Result<()> {
    let (processor, _) = bound("SELECT destination FROM flights WHERE flight_id > 100")?;

    let out = processor.process(flight(123, "SFO")).await?;

    assert!(out.is_none(), "expected filter on a dropped column to never match, got {:?}", out);
    Ok(())
}

#[tokio::test]
async fn other_streams_pass_through() -> Result<()> {
    let (processor, _) = bound("SELECT destination FROM flights WHERE flight_id = 1")?;
    let airport = Message::new("airports", EventKind::Insert, vec![Field::new("code", "SFO")]);

    let out = processor.process(airport.clone()).await?;

    assert!(out.as_ref() == Some(&airport), "expected unrelated stream to pass through, got {:?}", out);
    Ok(())
}

#[tokio::test]
async fn incompatible_comparison_is_an_error() -> Result<()> {
    let (processor, _) = bound("SELECT * FROM flights WHERE destination = 5")?;

    let res = processor.process(flight(1, "SFO")).await;

    assert!(res.is_err(), "expected comparing a string with an int literal to fail, got {:?}", res);
    Ok(())
}
