pub struct Icons;

impl Icons {
    pub const ROCKET: &str = "🚀";
    pub const CHECK: &str = "✅";
    pub const WARN: &str = "⚠️";
    pub const INFO: &str = "ℹ️";
    pub const STATS: &str = "📊";
    pub const KEY: &str = "🔑";
    pub const PACKAGE: &str = "📦";
    pub const DATABASE: &str = "🗄️";
    pub const DEL: &str = "🗑️";
    pub const BROOM: &str = "🧹";
    pub const PERSON: &str = "👤";
    pub const CLOCK: &str = "⏱️";
}
