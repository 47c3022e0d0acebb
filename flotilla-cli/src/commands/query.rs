//! `flotilla query`

use anyhow::{Context, Result};
use chrono::Utc;
use flotilla_execution::{format_listing, query_mapped_jobs, ListingOptions};
use regex::Regex;
use std::time::Duration;

use crate::cli::QueryArgs;

pub fn listing_options(args: &QueryArgs) -> Result<ListingOptions> {
    let pattern = args
        .list
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("Invalid --list pattern")?;
    Ok(ListingOptions {
        display: args.display,
        max: args.max,
        pattern,
        show_descriptions: args.show_descriptions,
    })
}

pub async fn query_command(args: &QueryArgs) -> Result<()> {
    let options = listing_options(args)?;
    let batches = query_mapped_jobs(&args.endpoint, Duration::from_secs(args.timeout))
        .await
        .with_context(|| format!("Failed to query the pool at {}", args.endpoint))?;
    print!("{}", format_listing(&batches, &args.endpoint, &options, Utc::now()));
    Ok(())
}
