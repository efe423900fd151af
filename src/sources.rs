use anyhow::Result;

use crate::config::Config;
use crate::traits::ConnectorRegistry;

/// One row of `harvest connectors`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorStatus {
    pub label: String,
    pub categories: Vec<String>,
    pub archiving: bool,
    pub resuming: bool,
    /// Why the instance cannot be built, if it cannot.
    pub error: Option<String>,
}

/// Build every configured instance and report its capabilities.
pub fn get_connectors(config: &Config, registry: &ConnectorRegistry) -> Vec<ConnectorStatus> {
    config
        .instances()
        .into_iter()
        .map(|(connector_type, name)| {
            let label = format!("{}:{}", connector_type, name);
            let built = config
                .connector_settings(connector_type, name)
                .map_err(|e| e.to_string())
                .and_then(|settings| {
                    registry
                        .build(connector_type, settings)
                        .map_err(|e| e.to_string())
                });

            match built {
                Ok(connector) => {
                    let d = connector.descriptor();
                    ConnectorStatus {
                        label,
                        categories: d.categories().to_vec(),
                        archiving: d.has_archiving(),
                        resuming: d.has_resuming(),
                        error: None,
                    }
                }
                Err(e) => ConnectorStatus {
                    label,
                    categories: Vec::new(),
                    archiving: false,
                    resuming: false,
                    error: Some(e),
                },
            }
        })
        .collect()
}

pub fn list_connectors(config: &Config, registry: &ConnectorRegistry) -> Result<()> {
    println!("{:<16} DESCRIPTION", "TYPE");
    for entry in registry.entries() {
        println!("{:<16} {}", entry.type_name, entry.description);
    }

    println!();
    println!(
        "{:<32} {:<24} {:<10} {:<10} STATUS",
        "INSTANCE", "CATEGORIES", "ARCHIVING", "RESUMING"
    );
    for status in get_connectors(config, registry) {
        println!(
            "{:<32} {:<24} {:<10} {:<10} {}",
            status.label,
            status.categories.join(","),
            status.archiving,
            status.resuming,
            status.error.as_deref().unwrap_or("OK")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_capabilities_and_errors() {
        let config: Config = toml::from_str(
            r#"
            [connectors.filesystem.docs]
            root = "./docs"

            [connectors.http_json.broken]
            per_page = 10

            [connectors.http_json.tracker]
            url = "https://tracker.example.com/api/issues"
            category = "issue"
            ascending = true
            "#,
        )
        .unwrap();

        let statuses = get_connectors(&config, &ConnectorRegistry::with_builtins());
        assert_eq!(statuses.len(), 3);

        assert_eq!(statuses[0].label, "filesystem:docs");
        assert_eq!(statuses[0].categories, vec!["file"]);
        assert!(statuses[0].resuming);
        assert!(!statuses[0].archiving);

        assert_eq!(statuses[1].label, "http_json:broken");
        assert!(statuses[1].error.is_some());

        assert_eq!(statuses[2].categories, vec!["issue"]);
        assert!(statuses[2].archiving);
        assert!(statuses[2].resuming);
    }
}
