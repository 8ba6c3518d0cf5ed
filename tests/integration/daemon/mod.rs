mod dedup;
mod drc_policy;
mod grace;
mod ninep;
mod pool;
