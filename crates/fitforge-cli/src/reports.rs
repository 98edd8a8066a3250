use comfy_table::presets::ASCII_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use fitforge_core::controller::FitOutcome;
use fitforge_core::summary::Summary;

pub fn print_sorted_params(summary: &Summary, top: usize) {
    let mut table = Table::new();
    table
        .load_preset(ASCII_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let mut header = vec![
        Cell::new("Permutation").add_attribute(Attribute::Bold),
        Cell::new("Chi-Sq").fg(Color::Cyan),
    ];
    for name in &summary.names {
        header.push(Cell::new(name));
    }
    table.add_row(header);

    for i in 1..=(summary.names.len() + 1) {
        if let Some(col) = table.column_mut(i) {
            col.set_cell_alignment(CellAlignment::Right);
        }
    }

    for row in summary.rows.iter().take(top) {
        let mut cells = vec![
            Cell::new(row.perm),
            Cell::new(format!("{:.6}", row.score)).fg(Color::Cyan),
        ];
        for v in &row.values {
            cells.push(Cell::new(format!("{:.6e}", v)));
        }
        table.add_row(cells);
    }
    println!("\n{}", table);
}

pub fn print_best(outcome: &FitOutcome) {
    println!("\n=== 🏆 BEST FIT ===");
    println!("Score: {}", outcome.best.score);
    for (name, v) in outcome.names.iter().zip(&outcome.best.values) {
        println!("  {} = {}", name, v);
    }
}
