/// Batch prediction example
///
/// Run with:
/// ```
/// cargo run --example batch --features auto-download -- profiles.jsonl [out.csv]
/// ```

use demographer::record::load_jsonl;
use demographer::{ConfigFile, Predictor};
use std::fs::File;
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Demographer - Batch Prediction Example\n");

    let mut args = std::env::args().skip(1);
    let input = args.next().unwrap_or_else(|| "profiles.jsonl".to_string());
    let output = args.next();

    let config = ConfigFile::load_or_default("config.toml")?.into_predictor_config();
    let batch_size = config.batch_size;
    let use_image = config.variant.uses_image();

    let mut predictor = Predictor::with_config(config)?;
    println!("✓ Model loaded\n");

    let records = load_jsonl(&input)?;
    println!("Predicting {} profiles in batches of {}...\n", records.len(), batch_size);

    let start = Instant::now();
    let result = predictor.infer(&records, batch_size, use_image)?;
    let elapsed = start.elapsed();

    println!("{}", "=".repeat(72));
    println!("{:<24} | {:^8} | {:^8} | {:^8} | {:>8}", "Id", "Gender", "Age", "Org", "Org %");
    println!("{}", "=".repeat(72));

    for (id, prediction) in result.iter() {
        let truncated = if id.chars().count() > 21 {
            format!("{}...", id.chars().take(21).collect::<String>())
        } else {
            id.to_string()
        };

        println!(
            "{:<24} | {:^8} | {:^8} | {:^8} | {:>7.1}%",
            truncated,
            prediction.gender.top(),
            prediction.age.top(),
            prediction.org.top(),
            prediction.org.get("is-org").unwrap_or(0.0) * 100.0
        );
    }

    println!("{}", "=".repeat(72));
    if records.len() != result.len() {
        println!("! {} duplicate ids skipped", records.len() - result.len());
    }

    if let Some(path) = output {
        result.write_csv(File::create(&path)?)?;
        println!("✓ Table written to {}", path);
    }

    println!("\n✓ Batch prediction complete");
    println!(
        "  Time: {}ms ({:.2}ms per profile)",
        elapsed.as_millis(),
        elapsed.as_millis() as f64 / records.len().max(1) as f64
    );

    Ok(())
}
