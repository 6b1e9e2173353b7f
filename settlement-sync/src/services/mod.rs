pub mod decision;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod payloads;
pub mod reconcile;
pub mod remediation;
pub mod repository;
pub mod tracking;
pub mod txlog;
pub mod zoho;
