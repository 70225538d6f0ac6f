pub mod config;
pub mod filter;
pub mod milter;
pub mod record;
pub mod replay;
pub mod rules;
pub mod session;
pub mod sink;

pub use config::Config;
pub use filter::{FilterEngine, Verdict, REJECT_REPLY};
pub use milter::Milter;
pub use record::MailRecord;
pub use rules::{Category, DomainPolicy, RuleSet};
pub use session::{Response, Session, SessionFactory};
pub use sink::{JsonDirSink, RecordSink};
