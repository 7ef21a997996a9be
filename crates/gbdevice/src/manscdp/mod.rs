// MANSCDP 控制协议（XML over SIP MESSAGE）

pub mod xml;
pub mod dispatcher;

pub use xml::{parse_xml, XmlNode};
pub use dispatcher::{ControlAction, DispatchResult, ManscdpDispatcher};
