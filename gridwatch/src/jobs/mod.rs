// gridwatch/src/jobs/mod.rs
//
// One-shot batch jobs, run on a schedule by the deployment rather than
// consuming a topic.

pub mod kpi;
