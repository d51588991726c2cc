//! Create command - knowledge bases and collections.

use super::open_store;
use crate::cli::{CreateTarget, Output};
use crate::config::Settings;
use anyhow::Result;

/// Run the create command.
pub fn run_create(target: &CreateTarget, settings: Settings) -> Result<()> {
    let store = open_store(&settings)?;

    match target {
        CreateTarget::KnowledgeBase { name, description } => {
            let kb = store.create_knowledge_base(
                &settings.general.tenant_id,
                name,
                description.as_deref(),
            )?;
            Output::success(&format!("Created knowledge base '{}'", kb.name));
            Output::kv("Id", &kb.id);
            Output::kv("Tenant", &kb.tenant_id);
        }
        CreateTarget::Collection {
            knowledge_base,
            name,
            description,
        } => {
            let collection =
                store.create_collection(knowledge_base, name, description.as_deref())?;
            Output::success(&format!("Created collection '{}'", collection.name));
            Output::kv("Id", &collection.id);
            Output::kv("Knowledge base", &collection.knowledge_base_id);
        }
    }

    Ok(())
}
