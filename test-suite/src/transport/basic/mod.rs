mod test_echo;
mod test_fragment;
mod test_lifecycle;
mod test_reconnect;
