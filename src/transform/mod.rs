pub mod annotator;
pub mod dumper;

pub use annotator::NodeAnnotator;
pub use dumper::TemplateDumper;
