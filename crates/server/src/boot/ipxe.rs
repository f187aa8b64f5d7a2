use std::fmt::Write;

use super::{BootContext, ClusterDirective};

/// 集群组建指令行，create_new 与 join_existing 的脚本只在这一行不同
fn directive_line(directive: &ClusterDirective) -> String {
    match directive {
        ClusterDirective::Create {
            cluster_ip,
            redundancy_factor,
            dns_servers,
        } => format!(
            "set cluster-action create:{}:rf{}:dns={}",
            cluster_ip,
            redundancy_factor,
            dns_servers.join(",")
        ),
        ClusterDirective::Join { cluster_ip } => format!("set cluster-action join:{}", cluster_ip),
    }
}

/// 渲染 iPXE 启动脚本
pub fn render_boot_script(ctx: &BootContext) -> String {
    let mut script = String::new();
    let image = format!("{}/{}", ctx.image_base_url, ctx.server_profile);

    // 写入 String 不会失败
    let _ = writeln!(script, "#!ipxe");
    let _ = writeln!(script, "echo Provisioning {} ({})", ctx.hostname, ctx.dns_name);
    let _ = writeln!(script, "set node-id {}", ctx.node_id);
    let _ = writeln!(script, "set hostname {}", ctx.hostname);
    let _ = writeln!(script, "set mgmt-ip {}", ctx.management_ip);
    let _ = writeln!(script, "set workload-ip {}", ctx.workload_ip);
    let _ = writeln!(script, "set role {}", ctx.role.as_str());
    let _ = writeln!(script, "set position {}", ctx.position);
    let _ = writeln!(script, "set config-url {}", ctx.config_url());
    let _ = writeln!(script, "set phase-url {}", ctx.phase_url());
    let _ = writeln!(script, "{}", directive_line(&ctx.directive));
    let _ = writeln!(
        script,
        "kernel {}/kernel initrd=initrd node_id=${{node-id}} hostname=${{hostname}} mgmt_ip=${{mgmt-ip}} workload_ip=${{workload-ip}} role=${{role}} config_url=${{config-url}} phase_url=${{phase-url}} cluster_action=${{cluster-action}}",
        image
    );
    let _ = writeln!(script, "initrd {}/initrd", image);
    let _ = writeln!(script, "boot");

    script
}
