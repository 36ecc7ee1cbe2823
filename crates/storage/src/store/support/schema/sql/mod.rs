#![forbid(unsafe_code)]

mod indexes;
mod job_events;
mod jobs;
mod meta;

pub(super) fn full_schema_sql() -> String {
    let mut sql = String::new();
    sql.push_str(meta::SQL);
    sql.push_str(jobs::SQL);
    sql.push_str(job_events::SQL);
    sql.push_str(indexes::SQL);
    sql
}
