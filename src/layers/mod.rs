pub mod depth_conv;
