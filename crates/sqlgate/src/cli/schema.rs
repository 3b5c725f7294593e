//! `sqlgate schema`: print the allowlist the caller will see.

use anyhow::Result;
use sqlgate::GatewayConfig;
use sqlgate_mcp::InformationSchema;

pub fn run(config: &GatewayConfig, json: bool) -> Result<()> {
    let policy = config.build_policy()?;
    let schema = InformationSchema::from_policy(&policy);

    if json {
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let statements: Vec<String> = schema
        .allowed_statements
        .iter()
        .map(|kind| kind.to_string())
        .collect();
    println!("max rows:   {}", schema.max_rows);
    println!("statements: {}", statements.join(", "));
    println!();

    for (name, table) in &schema.tables {
        match &table.description {
            Some(description) => println!("{}  -- {}", name, description),
            None => println!("{}", name),
        }
        for column in &table.columns {
            println!("    {}", column);
        }
    }

    Ok(())
}
