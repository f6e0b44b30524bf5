use anyhow::Result;
use bulkmail::recipients;
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: bulkmail-analyze <recipients.csv>");
        std::process::exit(1);
    }

    let table = recipients::load_csv_path(Path::new(&args[1]))?;
    if let Err(e) = recipients::validate(&table) {
        eprintln!("Warning: {}", e);
    }

    let analysis = recipients::analyze(&table);
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}
