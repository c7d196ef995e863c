/// Simple example of using the demographer library
///
/// Run with:
/// ```
/// cargo run --example simple --features auto-download
/// ```
use demographer::{Label, ModelVariant, Predictor, PredictorConfig, ProfileRecord};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Demographer - Simple Example\n");

    // The text model needs no profile images
    println!("Loading model...");
    let config = PredictorConfig::new().with_variant(ModelVariant::Text);
    let mut predictor = Predictor::with_config(config)?;
    println!("✓ Model loaded\n{}\n", predictor.model_info());

    let records = vec![
        ProfileRecord::new("1", "en", "Ada Lovelace", "ada_l", "Poetical scientist. Engines, numbers, notes."),
        ProfileRecord::new("2", "en", "Acme Hardware", "acmehq", "Official account. Anvils shipped worldwide https://acme.example"),
        ProfileRecord::new("3", "es", "Lucía", "lucia_2009", "me gusta el fútbol ⚽"),
    ];

    println!("Making predictions...\n");
    println!("{}", "=".repeat(70));

    let result = predictor.predict_batch(&records)?;
    for record in &records {
        let Some(prediction) = result.get(&record.id) else {
            continue;
        };

        println!("\n@{} ({})", record.screen_name, record.name);
        for label in Label::ALL {
            let dist = prediction.get(label);
            let scores: Vec<String> = label
                .categories()
                .iter()
                .zip(dist.scores())
                .map(|(category, score)| format!("{} {:.1}%", category, score * 100.0))
                .collect();
            println!("  {:<7} {:<8} [{}]", label, dist.top(), scores.join(", "));
        }
    }

    println!("\n{}", "=".repeat(70));
    println!("\nJSON output:\n{}", result.to_json()?);

    Ok(())
}
