// src/contracts.rs
use ethers::prelude::abigen;

abigen!(
    IERC20,
    r#"[
        function allowance(address owner, address spender) external view returns (uint256)
        function balanceOf(address account) external view returns (uint256)
        function approve(address spender, uint256 amount) external returns (bool)
        function transferFrom(address from, address to, uint256 amount) external returns (bool)
    ]"#
);

abigen!(
    IEntryPoint,
    r#"[
        function getNonce(address sender, uint192 key) external view returns (uint256)
        function balanceOf(address account) external view returns (uint256)
        function depositTo(address account) external payable
    ]"#
);

abigen!(
    ISimpleAccount,
    r#"[
        function execute(address dest, uint256 value, bytes func) external
    ]"#
);
