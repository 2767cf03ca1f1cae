use anyhow::{bail, Context, Result};
use lims_core::LimsConfig;
use lims_monitoring::logging::{init_logging, LogExt};
use lims_templates::{parse_and_validate_template_document, TemplateError};
use tracing::error;

const USAGE: &str = "usage: lims-admin check [templates.yaml] | lims-admin version";

fn main() -> Result<()> {
    let config = LimsConfig::load().context("Failed to load configuration")?;
    init_logging(&config.monitoring_config()).context("Failed to initialize logging")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["check", path] => check(path),
        ["check"] => match config.templates_path.as_deref() {
            Some(path) => check(path),
            None => bail!("No template document given and templates_path is not configured"),
        },
        ["version"] => {
            println!("lims-admin {} (templates {})", env!("CARGO_PKG_VERSION"), lims_templates::version());
            Ok(())
        }
        _ => bail!(USAGE),
    }
}

fn check(path: &str) -> Result<()> {
    let yaml = std::fs::read_to_string(path)
        .log_err("Failed to read template document")
        .with_context(|| format!("Cannot read {}", path))?;

    match parse_and_validate_template_document(&yaml) {
        Ok(document) => {
            for template in &document.templates {
                println!(
                    "{}\t{}\t{}\t{} attribute(s)",
                    template.id(),
                    template.category,
                    template.name,
                    template.attributes.len()
                );
            }
            Ok(())
        }
        Err(err) => {
            error!(path, error_code = err.error_code(), "Template document is invalid");
            print_errors(&err);
            bail!("{} is not a valid template document", path)
        }
    }
}

fn print_errors(err: &TemplateError) {
    let violations = err.validation_errors();
    if violations.is_empty() {
        eprintln!("{}", err);
    }
    for violation in violations {
        eprintln!("{}", violation);
    }
}
