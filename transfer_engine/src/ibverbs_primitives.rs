//! Plain data types and discovery helpers for talking to libibverbs.
//!
//! Primitives:
//! - `RdmaDevice` / `RdmaPort`: a snapshot of one device (i.e. `mlx5_0`) and its ports, as
//!   reported by `ibv_query_device` and `ibv_query_port`.
//! - `LinkType`: the logical link layer a context is asked to run on (InfiniBand or RoCE).
//! - `OpCode`: the operation carried by an assignment.
//! - `ConnectionDescriptor`: everything a peer needs to drive our queue pair to RTR/RTS.
//!
//! Discovery functions open each device briefly and close it again; they never keep
//! verbs resources alive.
use std::ffi::CStr;
use std::fmt;
use std::str::FromStr;

use ibverbs::Gid;

const LINK_LAYER_INFINIBAND: u8 = 1;
const LINK_LAYER_ETHERNET: u8 = 2;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RdmaDevice {
    name: String,
    fw_ver: String,
    node_guid: u64,
    vendor_id: u32,
    ports: Vec<RdmaPort>,
    max_qp: i32,
    max_qp_wr: i32,
    max_cq: i32,
    max_mr: i32,
    max_mr_size: u64,
    max_sge: i32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RdmaPort {
    port_num: u8,
    state: String,
    physical_state: String,
    lid: u16,
    link_layer: String,
    active_mtu: u32,
    gid: String,
    gid_tbl_len: i32,
}

impl RdmaDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> &[RdmaPort] {
        &self.ports
    }

    pub fn max_mr(&self) -> i32 {
        self.max_mr
    }

    pub fn max_mr_size(&self) -> u64 {
        self.max_mr_size
    }

    pub fn max_qp_wr(&self) -> i32 {
        self.max_qp_wr
    }
}

impl RdmaPort {
    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    pub fn link_layer(&self) -> &str {
        &self.link_layer
    }

    pub fn state(&self) -> &str {
        &self.state
    }
}

impl fmt::Display for RdmaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (fw {}, guid 0x{:016x})", self.name, self.fw_ver, self.node_guid)?;
        writeln!(f, "\tvendor: 0x{:x}", self.vendor_id)?;
        writeln!(f, "\tmax_qp: {} max_qp_wr: {}", self.max_qp, self.max_qp_wr)?;
        writeln!(f, "\tmax_cq: {} max_sge: {}", self.max_cq, self.max_sge)?;
        writeln!(f, "\tmax_mr: {} max_mr_size: {}", self.max_mr, self.max_mr_size)?;
        for port in &self.ports {
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

impl fmt::Display for RdmaPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "\tport {}: {} ({}), link layer {}",
            self.port_num, self.state, self.physical_state, self.link_layer
        )?;
        writeln!(
            f,
            "\t\tlid {} active_mtu {} gid[0] {} gid table {}",
            self.lid, self.active_mtu, self.gid, self.gid_tbl_len
        )
    }
}

pub fn get_port_state_str(state: ffi::ibv_port_state::Type) -> String {
    // SAFETY: ibv_port_state_str returns a pointer to a static string or null.
    unsafe {
        let c_str = ffi::ibv_port_state_str(state);
        if c_str.is_null() {
            return "Unknown".to_string();
        }
        CStr::from_ptr(c_str).to_string_lossy().into_owned()
    }
}

pub fn get_port_phy_state_str(phys_state: u8) -> String {
    let s = match phys_state {
        1 => "Sleep",
        2 => "Polling",
        3 => "Disabled",
        4 => "PortConfigurationTraining",
        5 => "LinkUp",
        6 => "LinkErrorRecovery",
        7 => "PhyTest",
        _ => "No state change",
    };
    s.to_string()
}

pub fn get_link_layer_str(link_layer: u8) -> String {
    match link_layer {
        LINK_LAYER_INFINIBAND => "InfiniBand".to_string(),
        LINK_LAYER_ETHERNET => "Ethernet".to_string(),
        _ => "Unknown".to_string(),
    }
}

/// Renders a raw GID as eight colon separated 16-bit groups.
pub fn format_gid(gid: &[u8; 16]) -> String {
    gid.chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(":")
}

/// True for `::ffff:a.b.c.d` GIDs, the form RoCE v2 uses for IPv4 addresses.
pub fn is_ipv4_mapped_gid(gid: &[u8; 16]) -> bool {
    gid[..10].iter().all(|b| *b == 0) && gid[10] == 0xff && gid[11] == 0xff
}

/// Reads the RoCE type of a GID table entry from sysfs (`"IB/RoCE v1"` or `"RoCE v2"`).
pub fn gid_type(device: &str, port: u8, index: i32) -> Option<String> {
    let path = format!("/sys/class/infiniband/{device}/ports/{port}/gid_attrs/types/{index}");
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

/// Retrieves information about all RDMA devices visible to this process.
///
/// Devices that cannot be opened or queried are skipped. An empty vector means
/// either no devices exist or none of them could be queried.
pub fn get_all_devices() -> Vec<RdmaDevice> {
    let mut devices = Vec::new();

    // SAFETY: every pointer returned by libibverbs is checked for null before use,
    // and each opened context is closed before moving on.
    unsafe {
        let mut num_devices = 0;
        let device_list = ffi::ibv_get_device_list(&mut num_devices);
        if device_list.is_null() {
            return devices;
        }

        for i in 0..num_devices {
            let device = *device_list.add(i as usize);
            if device.is_null() {
                continue;
            }

            let context = ffi::ibv_open_device(device);
            if context.is_null() {
                continue;
            }

            let name = CStr::from_ptr(ffi::ibv_get_device_name(device))
                .to_string_lossy()
                .into_owned();

            let mut device_attr = ffi::ibv_device_attr::default();
            if ffi::ibv_query_device(context, &mut device_attr) != 0 {
                ffi::ibv_close_device(context);
                continue;
            }

            let mut rdma_device = RdmaDevice {
                name,
                fw_ver: CStr::from_ptr(device_attr.fw_ver.as_ptr())
                    .to_string_lossy()
                    .into_owned(),
                node_guid: device_attr.node_guid,
                vendor_id: device_attr.vendor_id,
                ports: Vec::new(),
                max_qp: device_attr.max_qp,
                max_qp_wr: device_attr.max_qp_wr,
                max_cq: device_attr.max_cq,
                max_mr: device_attr.max_mr,
                max_mr_size: device_attr.max_mr_size,
                max_sge: device_attr.max_sge,
            };

            for port_num in 1..=device_attr.phys_port_cnt {
                let mut port_attr = ffi::ibv_port_attr::default();
                if ffi::ibv_query_port(
                    context,
                    port_num,
                    &mut port_attr as *mut ffi::ibv_port_attr as *mut _,
                ) != 0
                {
                    continue;
                }

                let mut gid = ffi::ibv_gid::default();
                let gid_str = if ffi::ibv_query_gid(context, port_num, 0, &mut gid) == 0 {
                    format_gid(&gid.raw)
                } else {
                    "N/A".to_string()
                };

                rdma_device.ports.push(RdmaPort {
                    port_num,
                    state: get_port_state_str(port_attr.state),
                    physical_state: get_port_phy_state_str(port_attr.phys_state),
                    lid: port_attr.lid,
                    link_layer: get_link_layer_str(port_attr.link_layer),
                    active_mtu: port_attr.active_mtu,
                    gid: gid_str,
                    gid_tbl_len: port_attr.gid_tbl_len,
                });
            }

            devices.push(rdma_device);
            ffi::ibv_close_device(context);
        }

        ffi::ibv_free_device_list(device_list);
    }

    devices
}

/// Names of every RDMA device on this host, in enumeration order.
pub fn available_nics() -> Vec<String> {
    get_all_devices()
        .into_iter()
        .map(|device| device.name)
        .collect()
}

/// The link layer a device context is expected to run on.
///
/// The physical port must report the same link layer; `Ethernet` means RoCE and
/// requires GID based routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LinkType {
    InfiniBand,
    #[default]
    Ethernet,
}

impl LinkType {
    pub(crate) fn matches(&self, link_layer: u8) -> bool {
        match self {
            LinkType::InfiniBand => link_layer == LINK_LAYER_INFINIBAND,
            LinkType::Ethernet => link_layer == LINK_LAYER_ETHERNET,
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::InfiniBand => write!(f, "InfiniBand"),
            LinkType::Ethernet => write!(f, "Ethernet"),
        }
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ib" | "infiniband" => Ok(LinkType::InfiniBand),
            "ethernet" | "eth" | "roce" => Ok(LinkType::Ethernet),
            other => Err(format!("unknown link type: {other}")),
        }
    }
}

/// Operation carried by an assignment.
///
/// Only `Read` is posted to hardware today; `Send` and `Recv` exist so that
/// assignments can describe them and contexts can reject them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OpCode {
    Read,
    Send,
    Recv,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Read => write!(f, "READ"),
            OpCode::Send => write!(f, "SEND"),
            OpCode::Recv => write!(f, "RECV"),
        }
    }
}

impl TryFrom<OpCode> for ffi::ibv_wr_opcode::Type {
    type Error = OpCode;

    fn try_from(op: OpCode) -> Result<Self, Self::Error> {
        match op {
            OpCode::Read => Ok(ffi::ibv_wr_opcode::IBV_WR_RDMA_READ),
            OpCode::Send => Ok(ffi::ibv_wr_opcode::IBV_WR_SEND),
            OpCode::Recv => Err(op),
        }
    }
}

/// How the remote port is addressed: by LID on InfiniBand, by GID on RoCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortAddress {
    Lid(u16),
    Gid(Gid),
}

/// Everything the peer needs to move our queue pair through RTR and RTS.
///
/// # Fields
///
/// * `qpn` - Queue pair number of the local RC queue pair
/// * `psn` - Initial packet sequence number (24 bits)
/// * `lid_or_gid` - Port address, LID for InfiniBand and GID for RoCE
/// * `mtu` - Active path MTU of the local port (an `ibv_mtu` value)
/// * `gidx` - GID table index used for the local side, RoCE only
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionDescriptor {
    pub qpn: u32,
    pub psn: u32,
    pub lid_or_gid: PortAddress,
    pub mtu: u32,
    pub gidx: Option<u8>,
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qpn: {} psn: 0x{:06x} mtu: {}", self.qpn, self.psn, self.mtu)?;
        match self.lid_or_gid {
            PortAddress::Lid(lid) => write!(f, " lid: {lid}"),
            PortAddress::Gid(gid) => {
                let raw: ffi::ibv_gid = gid.into();
                // SAFETY: every bit pattern of the union is a valid byte array.
                let bytes = unsafe { raw.raw };
                write!(f, " gid: {} gidx: {:?}", format_gid(&bytes), self.gidx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_gid() {
        let gid = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];
        assert_eq!(format_gid(&gid), "1234:5678:9abc:def0:1122:3344:5566:7788");
    }

    #[test]
    fn test_ipv4_mapped_gid() {
        let mut gid = [0u8; 16];
        gid[10] = 0xff;
        gid[11] = 0xff;
        gid[12..].copy_from_slice(&[10, 0, 0, 7]);
        assert!(is_ipv4_mapped_gid(&gid));

        // Link-local IPv6 GID.
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        assert!(!is_ipv4_mapped_gid(&gid));
    }

    #[test]
    fn test_link_type_parse() {
        assert_eq!("IB".parse::<LinkType>().unwrap(), LinkType::InfiniBand);
        assert_eq!("Ethernet".parse::<LinkType>().unwrap(), LinkType::Ethernet);
        assert_eq!("roce".parse::<LinkType>().unwrap(), LinkType::Ethernet);
        assert!("token-ring".parse::<LinkType>().is_err());
        assert!(LinkType::InfiniBand.matches(1));
        assert!(!LinkType::Ethernet.matches(1));
    }

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(
            ffi::ibv_wr_opcode::Type::try_from(OpCode::Read),
            Ok(ffi::ibv_wr_opcode::IBV_WR_RDMA_READ)
        );
        assert_eq!(
            ffi::ibv_wr_opcode::Type::try_from(OpCode::Recv),
            Err(OpCode::Recv)
        );
    }

    #[test]
    fn test_descriptor_json_shape() {
        let descriptor = ConnectionDescriptor {
            qpn: 42,
            psn: 0x1234,
            lid_or_gid: PortAddress::Lid(7),
            mtu: 3,
            gidx: None,
        };
        let value = serde_json::to_value(descriptor).unwrap();
        assert_eq!(value["qpn"], 42);
        assert_eq!(value["lid_or_gid"]["lid"], 7);
        assert!(value["gidx"].is_null());

        let back: ConnectionDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, descriptor);
        assert!(format!("{}", back).contains("lid: 7"));
    }

    #[test]
    fn test_descriptor_rejects_missing_fields() {
        let err = serde_json::from_str::<ConnectionDescriptor>(
            r#"{"qpn": 1, "psn": 2, "mtu": 3, "gidx": null}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn test_get_all_devices() {
        let devices = get_all_devices();
        assert!(!devices.is_empty(), "No RDMA devices found");
        assert!(!devices[0].name().is_empty());
        assert!(!devices[0].ports().is_empty());
        assert_eq!(available_nics()[0], devices[0].name());
        assert!(format!("{}", devices[0]).contains(devices[0].name()));
    }
}
