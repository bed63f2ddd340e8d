mod image;
mod run;

pub use image::{ImageCommands, handle_image_command};
pub use run::{InstanceArgs, console_command, login_command, run_command};
