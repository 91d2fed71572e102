pub mod memory;
pub mod neo4j;

pub use memory::InMemoryGraphStore;
pub use neo4j::Neo4jStore;
