pub struct Icons;

impl Icons {
    pub const ROCKET: &str = "🚀";
    pub const CHECK: &str = "✅";
    pub const CROSS: &str = "❌";
    pub const WARN: &str = "⚠️";
    pub const FILE: &str = "📄";
    pub const FOLDER: &str = "📂";
    pub const BUILDING: &str = "🏢";
    pub const DATABASE: &str = "🗄️";
    pub const STOP: &str = "🛑";
    pub const TRIANGLE: &str = "🔺";
}
