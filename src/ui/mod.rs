pub mod icons;
pub mod output;
pub mod progress;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{dim, error, header, info, sql, step, success, timing, warn};
pub use progress::Spinner;
pub use table::{TableBuilder, properties_table, rows_table};
pub use theme::{Theme, theme};
