pub struct Icons;

impl Icons {
    pub const CHECK: &str = "✅";
    pub const CROSS: &str = "❌";
    pub const WARN: &str = "⚠️";
    pub const INFO: &str = "ℹ️";
    pub const DATABASE: &str = "🗄️";
    pub const STEP: &str = "➡️";
    pub const NEW: &str = "✨";
    pub const CLOCK: &str = "⏱️";
}
