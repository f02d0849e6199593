pub mod site_notes;
pub mod site_schema;
pub mod vendor;

pub use self::site_notes::SiteKnowledgeCache;
pub use self::site_schema::{SchemaRegistry, SiteSchema};
pub use self::vendor::{VendorRecord, VendorRegistry};
