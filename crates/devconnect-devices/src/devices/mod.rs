/*!
 * Bundled device drivers.
 *
 * Each driver module exposes its profile routes through `profiles()` and a
 * `device_info` helper for registering devices of its type.
 */

pub mod drive;
pub mod human_detect;
pub mod light;

pub use drive::DriveDriver;
pub use human_detect::HumanDetectDriver;
pub use light::LightDriver;
