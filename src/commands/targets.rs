//! `stackctl targets` - list teardown target sets

use anyhow::Result;
use colored::Colorize;

use super::Exit;
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context, long: bool) -> Result<Exit> {
    let config = super::load_config(ctx)?;
    let sets = config.target_sets();

    ui::header("Teardown target sets");
    for set in &sets {
        println!();
        println!(
            "  {} {} {}",
            set.id.bold(),
            format!("[{}]", set.source.label()).dimmed(),
            ui::plural(set.targets.len(), "target")
        );
        if let Some(description) = &set.description {
            ui::dim(description);
        }
        if long {
            let mut ordered: Vec<_> = set.targets.iter().collect();
            ordered.sort_by_key(|t| t.stage());
            for target in ordered {
                let stage = format!("{:<16}", target.stage().label());
                println!("    {} {}", stage.dimmed(), target);
            }
        }
    }
    println!();
    Ok(Exit::Success)
}
