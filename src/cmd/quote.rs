//! Commission quote command for `homebid quote`.

use anyhow::Result;

use homebid::market::bidding::format_cents;

use crate::Cli;

pub fn cmd_quote(cli: &Cli, amount_cents: i64, json: bool) -> Result<()> {
    let config = super::load_config(cli)?;
    let schedule = &config.commission.tiers;
    let breakdown = schedule.quote(amount_cents)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&breakdown)?);
        return Ok(());
    }

    let bound = match schedule.tiers()[breakdown.tier].up_to_cents {
        Some(cents) => format!("up to {}", format_cents(cents)),
        None => "no upper bound".to_string(),
    };
    println!("Amount:     {}", format_cents(breakdown.base_cents));
    println!(
        "Tier:       {} of {} ({})",
        breakdown.tier + 1,
        schedule.tiers().len(),
        bound
    );
    println!(
        "Rate:       {}.{:02}%",
        breakdown.rate_bps / 100,
        breakdown.rate_bps % 100
    );
    println!("Commission: {}", format_cents(breakdown.fee_cents));
    Ok(())
}
