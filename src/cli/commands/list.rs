//! List command implementation.

use super::open_store;
use crate::cli::Output;
use crate::config::Settings;
use anyhow::Result;

/// Run the list command: the full knowledge tree for the configured tenant.
pub fn run_list(settings: Settings) -> Result<()> {
    let store = open_store(&settings)?;
    let knowledge_bases = store.list_knowledge_bases(&settings.general.tenant_id)?;

    if knowledge_bases.is_empty() {
        Output::info("No knowledge bases yet. Use 'kilde create knowledge-base <name>' to start.");
        return Ok(());
    }

    for kb in &knowledge_bases {
        Output::header(&format!("{} ({})", kb.name, kb.id));
        let collections = store.list_collections(&kb.id)?;
        if collections.is_empty() {
            Output::info("No collections.");
            continue;
        }

        for collection in &collections {
            let documents = store.list_documents(&collection.id)?;
            Output::list_item(&format!(
                "{} ({}) - {} documents",
                collection.name,
                collection.id,
                documents.len()
            ));
            for doc in &documents {
                Output::kv(
                    &doc.name,
                    &format!("{} [{}] {}", doc.id, doc.source_kind, doc.status),
                );
            }
        }
    }

    Ok(())
}
