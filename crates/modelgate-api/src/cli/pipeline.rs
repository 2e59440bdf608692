//! `mgate pipelines`: list registered pipelines.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

pub fn list(state: &AppState, json: bool) -> Result<()> {
    let pipelines = state.engine.registry().pipelines();

    if json {
        let out: Vec<_> = pipelines.iter().map(|p| p.definition()).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if pipelines.is_empty() {
        println!();
        println!("  No pipelines registered.");
        println!(
            "  Add YAML files under: {}",
            style(state.data_dir.join("pipelines").display()).dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Steps"),
            Cell::new("Models"),
            Cell::new("Description"),
        ]);
    for pipeline in &pipelines {
        let def = pipeline.definition();
        table.add_row(vec![
            Cell::new(&def.name),
            Cell::new(def.total_steps()),
            Cell::new(def.required_models().join(", ")),
            Cell::new(def.description.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
