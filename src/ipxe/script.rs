//! Per-machine iPXE boot script rendering.
//!
//! The script hands the machine over to the OSIE image and the workflow
//! server. Nothing is cached: every request re-queries the inventory so
//! edits take effect immediately.

use std::collections::BTreeMap;

use minijinja::{context, Environment};

use crate::backend::HardwareRecord;

/// Kernel/initrd architecture suffix used when a record does not carry
/// its own.
const DEFAULT_ARCH: &str = "x86_64";

const AUTO_IPXE: &str = r#"#!ipxe

echo Loading the netboot script for {{ mac }}
set packet_mac {{ mac }}
set base-url {{ base_url }}
set syslog_host {{ syslog_host }}
set tinkerbell {{ tink_url }}
set worker_id {{ mac }}
{% for key, value in metadata -%}
set {{ key }} {{ value }}
{% endfor -%}

kernel {{ base_url }}/vmlinuz-{{ arch }}{% if vlan_id %} vlan_id={{ vlan_id }}{% endif %}{% if facility %} facility={{ facility }}{% endif %} syslog_host={{ syslog_host }} tinkerbell={{ tink_url }} worker_id={{ mac }} hw_addr={{ mac }}{% for arg in extra_args %} {{ arg }}{% endfor %}{% for key, value in metadata %} {{ key }}={{ value }}{% endfor %} initrd=initramfs-{{ arch }}
initrd {{ base_url }}/initramfs-{{ arch }}
boot
"#;

/// Renders `auto.ipxe` for one hardware record.
pub struct ScriptRenderer {
    env: Environment<'static>,
    osie_url: String,
    extra_kernel_args: Vec<String>,
    syslog_host: String,
    tink_url: String,
}

impl ScriptRenderer {
    pub fn new(
        osie_url: impl Into<String>,
        extra_kernel_args: &str,
        syslog_host: impl Into<String>,
        tink_server: &str,
        tink_server_tls: bool,
    ) -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template("auto.ipxe", AUTO_IPXE)?;

        let scheme = if tink_server_tls { "https" } else { "http" };
        let osie_url: String = osie_url.into();

        Ok(Self {
            env,
            osie_url: osie_url.trim_end_matches('/').to_string(),
            extra_kernel_args: extra_kernel_args
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            syslog_host: syslog_host.into(),
            tink_url: format!("{scheme}://{tink_server}"),
        })
    }

    /// Render the script for `record`.
    ///
    /// Metadata keys are emitted in sorted order so identical inventory
    /// always produces byte-identical output.
    pub fn render(&self, record: &HardwareRecord) -> Result<String, minijinja::Error> {
        let mac = record.mac.to_string().to_lowercase();

        let base_url = record
            .osie
            .as_ref()
            .map(|osie| osie.base_url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| self.osie_url.clone());

        // A sorted pair list rather than the map itself: map iteration
        // order must not leak into the rendered bytes.
        let metadata: Vec<(&String, &String)> = {
            let sorted: BTreeMap<&String, &String> = record.metadata.iter().collect();
            sorted.into_iter().collect()
        };

        self.env.get_template("auto.ipxe")?.render(context! {
            mac => mac,
            base_url => base_url,
            arch => DEFAULT_ARCH,
            syslog_host => self.syslog_host,
            tink_url => self.tink_url,
            vlan_id => record.vlan_id,
            facility => record.facility,
            extra_args => self.extra_kernel_args,
            metadata => metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use macaddr::MacAddr6;

    use crate::backend::{Netboot, Osie};

    fn record() -> HardwareRecord {
        HardwareRecord {
            mac: MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01),
            ip: Ipv4Addr::new(10, 0, 0, 10),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            nameservers: vec![],
            hostname: None,
            domain: None,
            lease_time: 3600,
            vlan_id: None,
            netboot: Netboot {
                allow_pxe: true,
                ipxe_script_url: None,
            },
            osie: Some(Osie {
                base_url: "http://osie.local/img".to_string(),
            }),
            facility: Some("lab1".to_string()),
            metadata: HashMap::new(),
        }
    }

    fn renderer() -> ScriptRenderer {
        ScriptRenderer::new(
            "http://10.0.0.1/osie",
            "console=tty0 console=ttyS1,115200",
            "10.0.0.1",
            "10.0.0.5:42113",
            false,
        )
        .unwrap()
    }

    // The rendered script drives the machine into OSIE.
    #[test]
    fn test_render_sections() {
        let script = renderer().render(&record()).unwrap();

        assert!(script.starts_with("#!ipxe"));
        assert!(script.contains("set packet_mac aa:bb:cc:dd:ee:01"));
        assert!(script.contains("set base-url http://osie.local/img"));
        assert!(script.contains("set worker_id aa:bb:cc:dd:ee:01"));
        assert!(script.contains("set tinkerbell http://10.0.0.5:42113"));
        assert!(script.contains("kernel http://osie.local/img/vmlinuz-x86_64"));
        assert!(script.contains("facility=lab1"));
        assert!(script.contains("initrd http://osie.local/img/initramfs-x86_64"));
        assert!(script.trim_end().ends_with("boot"));
    }

    #[test]
    fn test_extra_kernel_args_appended() {
        let script = renderer().render(&record()).unwrap();
        assert!(script.contains(" console=tty0 console=ttyS1,115200"));
    }

    #[test]
    fn test_global_osie_url_when_no_override() {
        let mut record = record();
        record.osie = None;
        let script = renderer().render(&record).unwrap();
        assert!(script.contains("kernel http://10.0.0.1/osie/vmlinuz-x86_64"));
    }

    #[test]
    fn test_metadata_rendered_and_sorted() {
        let mut record = record();
        record.metadata.insert("plan".to_string(), "c3.small".to_string());
        record.metadata.insert("env".to_string(), "prod".to_string());

        let script = renderer().render(&record).unwrap();
        assert!(script.contains("set env prod"));
        assert!(script.contains("set plan c3.small"));
        assert!(script.contains(" env=prod"));
        assert!(script.contains(" plan=c3.small"));
        let env_pos = script.find("set env").unwrap();
        let plan_pos = script.find("set plan").unwrap();
        assert!(env_pos < plan_pos);
    }

    #[test]
    fn test_vlan_id_on_kernel_line() {
        let mut record = record();
        record.vlan_id = Some(400);
        let script = renderer().render(&record).unwrap();
        assert!(script.contains(" vlan_id=400"));
    }

    #[test]
    fn test_tls_scheme() {
        let renderer = ScriptRenderer::new(
            "http://10.0.0.1/osie",
            "",
            "10.0.0.1",
            "tink.example.com:42113",
            true,
        )
        .unwrap();

        let script = renderer.render(&record()).unwrap();
        assert!(script.contains("set tinkerbell https://tink.example.com:42113"));
    }

    // Identical inventory renders byte-identical output.
    #[test]
    fn test_render_is_deterministic() {
        let mut record = record();
        for i in 0..8 {
            record
                .metadata
                .insert(format!("key{i}"), format!("value{i}"));
        }

        let renderer = renderer();
        let first = renderer.render(&record).unwrap();
        let second = renderer.render(&record).unwrap();
        assert_eq!(first, second);
    }
}
