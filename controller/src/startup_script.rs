//! Renders the instance startup script: PostgreSQL auto-tuning from
//! `/proc/meminfo`/`/proc/cpuinfo`, pg_hba.conf rules, the standby
//! promote-trigger file, and the `godemand` bookkeeping table, plus
//! starting the loadavg probe service, templated with `tinytemplate`
//! so the per-instance paths and snapshot source can vary without
//! string-concatenating shell in the caller.

use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tinytemplate::TinyTemplate;

const TEMPLATE_NAME: &str = "startup";

const TEMPLATE: &str = r#"#!/bin/bash -e

total_mem=$(expr $(grep MemTotal /proc/meminfo | grep -o '[0-9]\+') )
hugepage_size=$(expr $(grep Hugepagesize /proc/meminfo | grep -o '[0-9]\+') )
cpu_count=$(grep -c processor /proc/cpuinfo)
max_workers=$(expr $cpu_count \* 2 + 2)

shared_buffers=$(expr $total_mem \/ 4)
hugepages_mem=$(expr $total_mem \/ 3)
effective_cache_size=$(expr $total_mem \* 3 \/ 4)
maintenance_work_mem=$(expr $total_mem \/ 16)
work_mem=$(expr $total_mem \/ 4 \/ 100)
nr_hugepages=$(expr $hugepages_mem \/ $hugepage_size + 1)

echo $nr_hugepages > /proc/sys/vm/nr_hugepages
echo "never" > /sys/kernel/mm/transparent_hugepage/enabled

echo "listen_addresses = '*'" >> {config_path}

sed -i "s/^max_connections = .*/max_connections = 400/g" {config_path}
sed -i "s/^shared_buffers = .*/shared_buffers = $(expr $shared_buffers \/ 1024)MB/g" {config_path}
sed -i "s/^effective_cache_size = .*/effective_cache_size = $(expr $effective_cache_size \/ 1024)MB/g" {config_path}
sed -i "s/^maintenance_work_mem = .*/maintenance_work_mem = $(expr $maintenance_work_mem \/ 1024)MB/g" {config_path}
sed -i "s/^work_mem = .*/work_mem = $(echo $work_mem)kB/g" {config_path}

sed -i "s/^max_worker_processes = .*/max_worker_processes = $(echo $max_workers)/g" {config_path}
sed -i "s/^max_parallel_workers_per_gather = .*/max_parallel_workers_per_gather = $(echo $cpu_count)/g" {config_path}

echo "random_page_cost = 6" >> {config_path}

grep -Fxq "host all all 10.0.0.0/8 md5" {hba_path} || echo "host all all 10.0.0.0/8 md5" >> {hba_path}
grep -Fxq "host all all 172.16.0.0/12 md5" {hba_path} || echo "host all all 172.16.0.0/12 md5" >> {hba_path}
grep -Fxq "host all all 192.168.0.0/16 md5" {hba_path} || echo "host all all 192.168.0.0/16 md5" >> {hba_path}

rm {recovery_config_path} || true

service postgresql restart

touch {trigger_path}
chown postgres:postgres {trigger_path}

until eval 'sudo -u postgres psql -c "create table if not exists godemand ( snapshot text PRIMARY KEY, boot_at timestamp with time zone default current_timestamp )"'
do
  sleep 1
done

until eval 'sudo -u postgres psql -c "insert into godemand (snapshot) values ('"'"'{snapshot_source}'"'"') on conflict do nothing"'
do
  sleep 1
done

cat > /etc/systemd/system/loadavg-probe.service <<'EOF'
[Unit]
Description=loadavg probe

[Service]
ExecStart=/usr/local/bin/loadavg-probe --listen 0.0.0.0:8743
Restart=always

[Install]
WantedBy=multi-user.target
EOF

systemctl daemon-reload
systemctl enable --now loadavg-probe.service
"#;

#[derive(Serialize)]
struct Context {
    config_path: String,
    hba_path: String,
    trigger_path: String,
    recovery_config_path: String,
    snapshot_source: String,
}

#[derive(Debug, Snafu)]
pub enum StartupScriptError {
    #[snafu(display("failed to compile startup script template: {}", source))]
    Compile { source: tinytemplate::error::Error },
    #[snafu(display("failed to render startup script: {}", source))]
    Render { source: tinytemplate::error::Error },
}

/// The paths and snapshot provenance threaded into the startup script.
/// `snapshot_source` is the disk's `source_snapshot` self-link, recorded
/// into the instance's `godemand` bookkeeping table so the running
/// server can tell which snapshot it booted from.
pub struct StartupParams {
    pub config_path: String,
    pub hba_path: String,
    pub trigger_path: String,
    pub recovery_config_path: String,
    pub snapshot_source: String,
}

impl StartupParams {
    /// No per-pool overrides for these paths exist yet, so a fixed
    /// Debian/Ubuntu postgresql.conf layout is assumed.
    pub fn with_defaults(pg_version: &str, snapshot_source: String) -> Self {
        let base = format!("/etc/postgresql/{}/main", pg_version);
        Self {
            config_path: format!("{}/postgresql.conf", base),
            hba_path: format!("{}/pg_hba.conf", base),
            trigger_path: "/tmp/postgresql.trigger".to_string(),
            recovery_config_path: format!("{}/recovery.conf", base),
            snapshot_source,
        }
    }
}

pub fn render(params: &StartupParams) -> Result<String, StartupScriptError> {
    let mut tt = TinyTemplate::new();
    tt.add_template(TEMPLATE_NAME, TEMPLATE).context(Compile)?;
    let ctx = Context {
        config_path: params.config_path.clone(),
        hba_path: params.hba_path.clone(),
        trigger_path: params.trigger_path.clone(),
        recovery_config_path: params.recovery_config_path.clone(),
        snapshot_source: params.snapshot_source.clone(),
    };
    tt.render(TEMPLATE_NAME, &ctx).context(Render)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_interpolates_paths_and_snapshot_source() {
        let params = StartupParams::with_defaults("11", "projects/p/global/snapshots/pg11-42".to_string());
        let script = render(&params).unwrap();
        assert!(script.contains("/etc/postgresql/11/main/postgresql.conf"));
        assert!(script.contains("/etc/postgresql/11/main/pg_hba.conf"));
        assert!(script.contains("projects/p/global/snapshots/pg11-42"));
        assert!(script.contains("loadavg-probe"));
    }
}
